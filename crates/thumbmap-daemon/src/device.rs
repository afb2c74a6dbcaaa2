//! Device enumeration and evdev helpers

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use evdev::{AbsoluteAxisType, BusType, Device, EventType, InputId, Key, PropType};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Hardware identity copied onto synthetic devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwIdentity {
    pub bus: BusType,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl HwIdentity {
    pub fn input_id(&self) -> InputId {
        InputId::new(self.bus, self.vendor, self.product, self.version)
    }
}

impl From<InputId> for HwIdentity {
    fn from(id: InputId) -> Self {
        Self {
            bus: id.bus_type(),
            vendor: id.vendor(),
            product: id.product(),
            version: id.version(),
        }
    }
}

/// Information about an input device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub identity: HwIdentity,
    pub is_keyboard: bool,
    pub is_touchpad: bool,
}

impl DeviceInfo {
    pub fn from_device(path: &Path, device: &Device) -> Self {
        Self {
            path: path.to_path_buf(),
            name: device.name().unwrap_or("Unknown").to_string(),
            identity: device.input_id().into(),
            is_keyboard: is_keyboard(device),
            is_touchpad: is_touchpad(device),
        }
    }

    /// Get vendor:product string (e.g., "3434:0361")
    pub fn vendor_product(&self) -> String {
        format!("{:04x}:{:04x}", self.identity.vendor, self.identity.product)
    }
}

/// Source of input device listings
pub trait DeviceCatalog {
    /// Every readable input device.
    fn list_all(&mut self) -> Vec<DeviceInfo>;

    /// Devices of the default class: touchpads.
    fn list_available_default_class(&mut self) -> Vec<DeviceInfo> {
        self.list_all()
            .into_iter()
            .filter(|d| d.is_touchpad)
            .collect()
    }

    /// Forget cached listings so the next call re-enumerates.
    fn reset(&mut self);
}

/// Catalog backed by `/dev/input/event*`
#[derive(Debug, Default)]
pub struct EvdevCatalog {
    cache: Option<Vec<DeviceInfo>>,
}

impl EvdevCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceCatalog for EvdevCatalog {
    fn list_all(&mut self) -> Vec<DeviceInfo> {
        if let Some(cached) = &self.cache {
            return cached.clone();
        }
        let devices = enumerate_devices();
        self.cache = Some(devices.clone());
        devices
    }

    fn reset(&mut self) {
        self.cache = None;
    }
}

/// Enumerate all input devices we are allowed to open
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = evdev::enumerate()
        .map(|(path, device)| DeviceInfo::from_device(&path, &device))
        .collect();
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Check if a device is a keyboard
pub fn is_keyboard(device: &Device) -> bool {
    device.supported_events().contains(EventType::KEY)
        && device
            .supported_keys()
            .map(|keys| keys.contains(Key::KEY_A))
            .unwrap_or(false)
}

/// Indirect multitouch pointer with finger tool reporting
pub fn is_touchpad(device: &Device) -> bool {
    let multitouch = device
        .supported_absolute_axes()
        .map(|axes| axes.contains(AbsoluteAxisType::ABS_MT_POSITION_X))
        .unwrap_or(false);
    let fingers = device
        .supported_keys()
        .map(|keys| keys.contains(Key::BTN_TOOL_FINGER))
        .unwrap_or(false);
    multitouch && fingers && !device.properties().contains(PropType::DIRECT)
}

/// Range and resolution of one absolute axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisRange {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

/// Read the absinfo of `axis`, if the device reports that axis.
pub fn axis_range(device: &Device, axis: AbsoluteAxisType) -> Option<AxisRange> {
    let supported = device
        .supported_absolute_axes()
        .map(|axes| axes.contains(axis))
        .unwrap_or(false);
    if !supported {
        return None;
    }

    let state = device.get_abs_state().ok()?;
    let info = state.get(axis.0 as usize)?;
    Some(AxisRange {
        value: info.value,
        minimum: info.minimum,
        maximum: info.maximum,
        fuzz: info.fuzz,
        flat: info.flat,
        resolution: info.resolution,
    })
}

/// Block until no key on `device` reads as pressed.
///
/// Grabbing while a key is down would leave it stuck for every other listener.
pub fn wait_release_all_keys(device: &Device, name: &str) {
    let started = Instant::now();
    let mut announced = false;

    loop {
        match device.get_key_state() {
            Ok(keys) if keys.iter().next().is_none() => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Could not read key state of '{}': {}", name, e);
                return;
            }
        }

        if crate::shutdown::requested_exit_code().is_some() {
            return;
        }
        if !announced && started.elapsed() > Duration::from_millis(200) {
            tracing::info!("Waiting for all keys on '{}' to be released...", name);
            announced = true;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Borrow the event fd of an open device for polling.
pub fn device_fd(device: &Device) -> BorrowedFd<'_> {
    // SAFETY: the fd stays open for as long as `device` is borrowed
    unsafe { BorrowedFd::borrow_raw(device.as_raw_fd()) }
}

/// Wait until any of `fds` is readable or `timeout` passes.
///
/// Returns one readiness flag per fd, all false on timeout. Hang-ups and
/// errors count as readable so the following read reports them.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> nix::Result<Vec<bool>> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

    if poll(&mut poll_fds, PollTimeout::from(millis))? == 0 {
        return Ok(vec![false; fds.len()]);
    }

    let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(poll_fds
        .iter()
        .map(|p| p.revents().is_some_and(|r| r.intersects(readable)))
        .collect())
}
