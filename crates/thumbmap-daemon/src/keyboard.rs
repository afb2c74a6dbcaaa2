//! The keyboard remapper process
//!
//! Grabs every matching keyboard, routes key events through the
//! [`RemapEngine`] into one synthetic keyboard, and forwards raw key frames
//! to the host. Layer changes arrive over the layer pipe.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use evdev::uinput::VirtualDevice;
use evdev::{BusType, Device, EventType, InputEvent};
use nix::errno::Errno;
use thumbmap_config::Config;

use crate::device::{device_fd, wait_readable, wait_release_all_keys, DeviceInfo, HwIdentity};
use crate::frame::write_frame;
use crate::injector::{
    create_keyboard, EventWriter, InjectorError, SyntheticDevice, VIRTUAL_KEYBOARD_NAME,
    VIRTUAL_TOUCHPAD_NAME,
};
use crate::layer_manager::LayerManager;
use crate::matcher::DeviceMatcher;
use crate::remapper::{EmergencyWatch, RemapEngine, SourceDevice};
use crate::selector::{DeviceSelector, POLL_INTERVAL};
use crate::shutdown::{self, Teardown, EXIT_FAILURE};

const EXIT_SUCCESS: i32 = 0;

struct GrabbedKeyboard {
    info: DeviceInfo,
    id: String,
    device: Device,
    tag: Option<String>,
    /// Non-key events waiting for their SYN_REPORT
    pending: Vec<InputEvent>,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Continue,
    Removed,
    Fatal(i32),
}

/// Everything between the physical keyboards and the outputs
///
/// Holds no evdev device, so it runs against in-memory writers in tests.
struct KeyboardCore<W: EventWriter = VirtualDevice> {
    engine: RemapEngine,
    layers: LayerManager,
    output: SyntheticDevice<W>,
    forward: File,
}

impl<W: EventWriter> KeyboardCore<W> {
    /// Route one batch of events read from a keyboard.
    ///
    /// Key events are written one report each. Other events wait in
    /// `pending` for their SYN_REPORT.
    fn handle_events(
        &mut self,
        source: &SourceDevice,
        pending: &mut Vec<InputEvent>,
        events: impl IntoIterator<Item = InputEvent>,
    ) -> ReadOutcome {
        for event in events {
            match event.event_type() {
                EventType::SYNCHRONIZATION => {
                    if pending.is_empty() {
                        continue;
                    }
                    let batch = std::mem::take(pending);
                    if let Err(e) = self.output.emit(&batch) {
                        tracing::error!("{}", e);
                    }
                }
                // scan codes describe the physical key, not what we emit
                EventType::MISC => {}
                _ => {
                    let outcome = self.engine.process(&mut self.layers, source, event);

                    if outcome.emergency {
                        tracing::warn!("Emergency ungrab keys pressed, releasing keyboards");
                        return ReadOutcome::Fatal(EXIT_SUCCESS);
                    }

                    if let Some(frame) = outcome.forward {
                        if let Err(e) = write_frame(&mut self.forward, &frame) {
                            tracing::error!("Failed to forward key to host: {}", e);
                            return ReadOutcome::Fatal(EXIT_FAILURE);
                        }
                    }

                    if event.event_type() == EventType::KEY {
                        self.emit_each(&outcome.events);
                    } else {
                        pending.extend(outcome.events);
                    }
                }
            }
        }
        ReadOutcome::Continue
    }

    fn emit_each(&mut self, events: &[InputEvent]) {
        for event in events {
            if let Err(e) = self.output.emit(&[*event]) {
                tracing::error!("{}", e);
            }
        }
    }

    /// Apply every layer change waiting on the pipe.
    fn receive_layers(&mut self) -> ReadOutcome {
        match self.layers.receive_layer() {
            Ok(layer) => {
                self.engine.set_layer(layer);
                ReadOutcome::Continue
            }
            Err(e) => {
                tracing::error!("Layer pipe closed: {}", e);
                ReadOutcome::Fatal(EXIT_FAILURE)
            }
        }
    }

    /// Lift the synthetic keys a removed keyboard was holding.
    fn forget(&mut self, id: &str) {
        let events = self.engine.release_device(id);
        self.emit_each(&events);
    }

    /// The set of keyboards changed; tables are resolved again.
    fn devices_changed(&mut self) {
        self.layers.invalidate();
        self.engine.invalidate();
    }
}

pub struct KeyboardRemapper {
    core: KeyboardCore,
    matcher: DeviceMatcher,
    selector: DeviceSelector<Device>,
    keyboards: Vec<GrabbedKeyboard>,
    teardown: Teardown,
    last_scan: Instant,
}

/// Identity for the synthetic keyboard, borrowed from a touchpad.
///
/// The bus is always i8042 so that libinput treats the keyboard as built in
/// and pairs it with the touchpad for disable-while-typing.
fn keyboard_identity(touchpad: HwIdentity) -> HwIdentity {
    HwIdentity {
        bus: BusType::BUS_I8042,
        ..touchpad
    }
}

/// Identity of the first touchpad, so the kernel pairs it with our keyboard.
fn touchpad_identity(config: &Config) -> Option<HwIdentity> {
    let mut touchpads = DeviceSelector::evdev(
        "touchpad",
        &config.touchpad.name_patterns,
        &[VIRTUAL_KEYBOARD_NAME, VIRTUAL_TOUCHPAD_NAME],
    );
    let identity = touchpads.candidates().first().map(|info| info.identity);
    if identity.is_none() {
        tracing::warn!("No touchpad found");
        tracing::warn!("Disable-while-typing will not pair the touchpad with the virtual keyboard");
    }
    identity
}

impl KeyboardRemapper {
    /// Create the synthetic keyboard and grab the physical ones.
    ///
    /// Blocks until at least one keyboard can be opened.
    ///
    /// # Arguments
    ///
    /// * `config` - Parsed configuration; keyboard patterns and the emergency keybind
    /// * `layers` - Receiving end of the layer pipe
    /// * `forward` - Write end of the pipe carrying raw key frames to the host
    ///
    /// # Errors
    ///
    /// Returns an error if the synthetic keyboard cannot be created, usually
    /// because `/dev/uinput` is not writable.
    pub fn start(
        config: Arc<Config>,
        layers: LayerManager,
        forward: File,
    ) -> Result<Self, InjectorError> {
        let identity = touchpad_identity(&config).map(keyboard_identity);
        let output = create_keyboard(VIRTUAL_KEYBOARD_NAME, identity)?;
        let engine = RemapEngine::new(EmergencyWatch::from_keybind(
            &config.keyboard.emergency_ungrab_keys,
        ));
        let selector = DeviceSelector::evdev(
            "keyboard",
            &config.keyboard.name_patterns,
            &[VIRTUAL_KEYBOARD_NAME, VIRTUAL_TOUCHPAD_NAME],
        );

        let mut remapper = Self {
            core: KeyboardCore {
                engine,
                layers,
                output,
                forward,
            },
            matcher: DeviceMatcher::new(config),
            selector,
            keyboards: Vec::new(),
            teardown: Teardown::new(),
            last_scan: Instant::now(),
        };

        for (info, device) in remapper.selector.select(true) {
            remapper.grab(info, device);
        }
        Ok(remapper)
    }

    fn grab(&mut self, info: DeviceInfo, mut device: Device) {
        wait_release_all_keys(&device, &info.name);

        if let Err(e) = device.grab() {
            if e.raw_os_error() == Some(Errno::EBUSY as i32) {
                tracing::warn!(
                    "'{}' is grabbed by another process, skipping",
                    info.name
                );
            } else {
                tracing::error!("Failed to grab '{}': {}", info.name, e);
            }
            return;
        }

        let tag = self.matcher.match_device(&info.name).map(str::to_string);
        tracing::info!(
            "Grabbed keyboard '{}' ({}) [{}]{}",
            info.name,
            info.path.display(),
            info.vendor_product(),
            tag.as_deref()
                .map(|t| format!(" as device={}", t))
                .unwrap_or_default()
        );

        self.keyboards.push(GrabbedKeyboard {
            id: info.path.display().to_string(),
            info,
            device,
            tag,
            pending: Vec::new(),
        });
    }

    /// Run until shutdown; returns the process exit status.
    pub fn run(mut self) -> i32 {
        loop {
            if let Some(code) = shutdown::requested_exit_code() {
                return self.destroy(code);
            }

            let mut fds: Vec<_> = self.keyboards.iter().map(|k| device_fd(&k.device)).collect();
            let keyboard_count = fds.len();
            if let Some(fd) = self.core.layers.reader_fd() {
                fds.push(fd);
            }

            let ready = match wait_readable(&fds, POLL_INTERVAL) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!("Failed to poll keyboards: {}", e);
                    return self.destroy(EXIT_FAILURE);
                }
            };
            let layer_ready = ready.get(keyboard_count).copied().unwrap_or(false);

            let mut removed = Vec::new();
            for index in 0..keyboard_count {
                if !ready[index] {
                    continue;
                }
                match self.read_keyboard(index) {
                    ReadOutcome::Continue => {}
                    ReadOutcome::Removed => removed.push(index),
                    ReadOutcome::Fatal(code) => return self.destroy(code),
                }
            }

            if !removed.is_empty() {
                for index in removed.into_iter().rev() {
                    let gone = self.keyboards.remove(index);
                    tracing::warn!("Keyboard '{}' was removed", gone.info.name);
                    self.core.forget(&gone.id);
                }
                self.rescan();
            }

            if layer_ready {
                if let ReadOutcome::Fatal(code) = self.core.receive_layers() {
                    return self.destroy(code);
                }
            }

            if self.last_scan.elapsed() >= POLL_INTERVAL {
                self.rescan();
            }
        }
    }

    fn read_keyboard(&mut self, index: usize) -> ReadOutcome {
        let keyboard = &mut self.keyboards[index];
        let events: Vec<InputEvent> = match keyboard.device.fetch_events() {
            Ok(events) => events.collect(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadOutcome::Continue,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::error!("Unexpected end of input from '{}'", keyboard.info.name);
                return ReadOutcome::Fatal(EXIT_FAILURE);
            }
            Err(e) => {
                tracing::debug!("Read from '{}' failed: {}", keyboard.info.name, e);
                return ReadOutcome::Removed;
            }
        };

        let source = SourceDevice {
            id: &keyboard.id,
            tag: keyboard.tag.as_deref(),
        };
        self.core.handle_events(&source, &mut keyboard.pending, events)
    }

    /// Grab keyboards that appeared since the last scan.
    fn rescan(&mut self) {
        self.last_scan = Instant::now();
        self.selector.reset();

        let known: Vec<PathBuf> = self.keyboards.iter().map(|k| k.info.path.clone()).collect();
        let found = self.selector.select_excluding(self.keyboards.is_empty(), &known);
        if found.is_empty() {
            return;
        }

        for (info, device) in found {
            self.grab(info, device);
        }
        self.core.devices_changed();
    }

    fn destroy(&mut self, code: i32) -> i32 {
        if !self.teardown.begin() {
            return code;
        }

        for keyboard in &mut self.keyboards {
            match keyboard.device.ungrab() {
                Ok(()) => tracing::info!("Released '{}'", keyboard.info.name),
                Err(e)
                    if matches!(
                        e.raw_os_error().map(Errno::from_raw),
                        Some(Errno::ENODEV | Errno::EINVAL)
                    ) => {}
                Err(e) => tracing::warn!("Failed to release '{}': {}", keyboard.info.name, e),
            }
        }
        self.keyboards.clear();

        if let Err(e) = self.core.output.destroy() {
            tracing::warn!("{}", e);
        }
        tracing::info!("Keyboard remapper stopped");
        code
    }
}
