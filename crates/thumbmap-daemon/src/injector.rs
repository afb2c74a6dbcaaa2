//! Synthetic output devices via uinput
//!
//! A [`SyntheticDevice`] owns its uinput handle until [`SyntheticDevice::destroy`]
//! is called. Destroying twice, or writing after destroy, reports
//! [`InjectorError::AlreadyDestroyed`] instead of panicking.

use std::io;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputEvent, Key, MiscType,
    RelativeAxisType, UinputAbsSetup,
};
use thiserror::Error;

use crate::device::{AxisRange, HwIdentity};

pub const VIRTUAL_KEYBOARD_NAME: &str = "thumbmap_virtual_keyboard";
pub const VIRTUAL_TOUCHPAD_NAME: &str = "thumbmap_virtual_touchpad";

/// Highest key code registered on the synthetic keyboard
const KEY_MAX: u16 = 0x2ff;

#[derive(Debug, Error)]
pub enum InjectorError {
    #[error("failed to create virtual device '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to virtual device '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("virtual device '{0}' was already destroyed")]
    AlreadyDestroyed(String),
}

/// Sink for synthesized events
///
/// Each call to `emit` is one report; the sink appends the SYN_REPORT.
pub trait EventWriter {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()>;
}

impl EventWriter for VirtualDevice {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()> {
        VirtualDevice::emit(self, events)
    }
}

/// Records reports in memory
impl EventWriter for Vec<Vec<InputEvent>> {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()> {
        self.push(events.to_vec());
        Ok(())
    }
}

pub struct SyntheticDevice<W: EventWriter = VirtualDevice> {
    name: String,
    writer: Option<W>,
}

pub type VirtualKeyboard = SyntheticDevice<VirtualDevice>;
pub type VirtualTouchpad = SyntheticDevice<VirtualDevice>;

impl<W: EventWriter> SyntheticDevice<W> {
    pub fn from_writer(name: &str, writer: W) -> Self {
        Self {
            name: name.to_string(),
            writer: Some(writer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn writer(&self) -> Option<&W> {
        self.writer.as_ref()
    }

    /// Write one event as its own report.
    pub fn write_event(&mut self, kind: EventType, code: u16, value: i32) -> Result<(), InjectorError> {
        self.emit(&[InputEvent::new(kind, code, value)])
    }

    /// Write several events as a single report.
    pub fn emit(&mut self, events: &[InputEvent]) -> Result<(), InjectorError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| InjectorError::AlreadyDestroyed(self.name.clone()))?;
        writer.emit(events).map_err(|source| InjectorError::Write {
            name: self.name.clone(),
            source,
        })
    }

    /// Remove the device from the system.
    pub fn destroy(&mut self) -> Result<(), InjectorError> {
        match self.writer.take() {
            Some(writer) => {
                // closing the uinput handle destroys the device
                drop(writer);
                tracing::info!("Destroyed virtual device '{}'", self.name);
                Ok(())
            }
            None => Err(InjectorError::AlreadyDestroyed(self.name.clone())),
        }
    }
}

fn create_error(name: &str) -> impl FnOnce(io::Error) -> InjectorError + '_ {
    move |source| InjectorError::Create {
        name: name.to_string(),
        source,
    }
}

/// Create the synthetic keyboard.
///
/// With an identity (usually the touchpad's), the kernel pairs the two for
/// disable-while-typing.
///
/// # Arguments
///
/// * `name` - The device name, also used to skip our own device when selecting
/// * `identity` - Bus, vendor, product and version to report, or `None` for defaults
///
/// # Errors
///
/// Returns [`InjectorError::Create`] if the device cannot be created (e.g.,
/// insufficient permissions to access /dev/uinput).
pub fn create_keyboard(name: &str, identity: Option<HwIdentity>) -> Result<VirtualKeyboard, InjectorError> {
    let mut keys = AttributeSet::<Key>::new();
    for code in 1..=KEY_MAX {
        keys.insert(Key::new(code));
    }

    let mut relative = AttributeSet::<RelativeAxisType>::new();
    for axis in [
        RelativeAxisType::REL_X,
        RelativeAxisType::REL_Y,
        RelativeAxisType::REL_WHEEL,
        RelativeAxisType::REL_HWHEEL,
    ] {
        relative.insert(axis);
    }

    let mut misc = AttributeSet::<MiscType>::new();
    misc.insert(MiscType::MSC_SCAN);

    let mut builder = VirtualDeviceBuilder::new()
        .map_err(create_error(name))?
        .name(name);
    if let Some(identity) = identity {
        builder = builder.input_id(identity.input_id());
    }

    let device = builder
        .with_keys(&keys)
        .and_then(|b| b.with_relative_axes(&relative))
        .and_then(|b| b.with_msc(&misc))
        .and_then(|b| b.build())
        .map_err(create_error(name))?;

    match identity {
        Some(id) => tracing::info!(
            "Created virtual keyboard '{}' ({:04x}:{:04x})",
            name,
            id.vendor,
            id.product
        ),
        None => tracing::info!("Created virtual keyboard '{}'", name),
    }

    Ok(SyntheticDevice::from_writer(name, device))
}

/// Axes copied from the physical touchpad
pub const TOUCHPAD_AXES: [AbsoluteAxisType; 7] = [
    AbsoluteAxisType::ABS_X,
    AbsoluteAxisType::ABS_Y,
    AbsoluteAxisType::ABS_MT_POSITION_X,
    AbsoluteAxisType::ABS_MT_POSITION_Y,
    AbsoluteAxisType::ABS_MT_SLOT,
    AbsoluteAxisType::ABS_MT_TOOL_TYPE,
    AbsoluteAxisType::ABS_MT_TRACKING_ID,
];

/// Create a synthetic touchpad with the given axis ranges.
///
/// # Arguments
///
/// * `name` - The device name
/// * `identity` - Identity of the physical touchpad being mirrored
/// * `axes` - Absolute axes to register, with the physical ranges
///
/// # Errors
///
/// Returns [`InjectorError::Create`] if uinput rejects the device or any axis.
pub fn create_touchpad(
    name: &str,
    identity: HwIdentity,
    axes: &[(AbsoluteAxisType, AxisRange)],
) -> Result<VirtualTouchpad, InjectorError> {
    let mut keys = AttributeSet::<Key>::new();
    for key in [
        Key::BTN_LEFT,
        Key::BTN_TOUCH,
        Key::BTN_TOOL_FINGER,
        Key::BTN_TOOL_DOUBLETAP,
        Key::BTN_TOOL_TRIPLETAP,
        Key::BTN_TOOL_QUADTAP,
        Key::BTN_TOOL_QUINTTAP,
    ] {
        keys.insert(key);
    }

    let mut builder = VirtualDeviceBuilder::new()
        .map_err(create_error(name))?
        .name(name)
        .input_id(identity.input_id())
        .with_keys(&keys)
        .map_err(create_error(name))?;

    for (axis, range) in axes {
        let info = AbsInfo::new(
            range.value,
            range.minimum,
            range.maximum,
            range.fuzz,
            range.flat,
            range.resolution,
        );
        builder = builder
            .with_absolute_axis(&UinputAbsSetup::new(*axis, info))
            .map_err(create_error(name))?;
    }

    let device = builder.build().map_err(create_error(name))?;
    tracing::info!("Created virtual touchpad '{}'", name);
    Ok(SyntheticDevice::from_writer(name, device))
}
