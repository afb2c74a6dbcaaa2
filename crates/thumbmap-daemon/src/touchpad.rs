//! Touchpad observation: multitouch decoding and the touchpad remapper loop
//!
//! Touchpads are read without grabbing, so the compositor keeps receiving
//! pointer motion. Only begin/end transitions of a valid touch are forwarded.

use std::collections::BTreeMap;
use std::fs::File;

use evdev::{AbsoluteAxisType, Device, InputEvent, InputEventKind, Key, MiscType, Synchronization};
use nix::errno::Errno;

use crate::device::{axis_range, device_fd, wait_readable, AxisRange, DeviceInfo};
use crate::frame::{write_frame, SlotFrame, TouchpadFrame};
use crate::injector::{
    create_touchpad, InjectorError, VirtualTouchpad, TOUCHPAD_AXES, VIRTUAL_KEYBOARD_NAME,
    VIRTUAL_TOUCHPAD_NAME,
};
use crate::palm::PalmDetection;
use crate::selector::{DeviceSelector, POLL_INTERVAL};
use crate::shutdown::{self, Teardown, EXIT_FAILURE};

#[derive(Debug, Clone, Default)]
struct SlotState {
    id: i32,
    x: Option<i32>,
    y: Option<i32>,
    /// Decided once, from the first complete position
    valid: Option<bool>,
}

/// Multitouch protocol B decoder with palm rejection
#[derive(Debug)]
pub struct TouchDecoder {
    palm: PalmDetection,
    slots: BTreeMap<i32, SlotState>,
    current_slot: i32,
    finger: u8,
    status: u8,
}

impl TouchDecoder {
    pub fn new(palm: PalmDetection) -> Self {
        Self {
            palm,
            slots: BTreeMap::new(),
            current_slot: 0,
            finger: 0,
            status: 0,
        }
    }

    /// Decoder using the position ranges reported by `device`.
    pub fn for_device(device: &Device) -> Self {
        let x = axis_range(device, AbsoluteAxisType::ABS_MT_POSITION_X).unwrap_or_default();
        let y = axis_range(device, AbsoluteAxisType::ABS_MT_POSITION_Y).unwrap_or_default();
        Self::new(PalmDetection::new(x, y))
    }

    pub fn finger(&self) -> u8 {
        self.finger
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Feed one event; returns a frame when the touch status flips.
    pub fn process(&mut self, event: InputEvent) -> Option<TouchpadFrame> {
        match event.kind() {
            InputEventKind::AbsAxis(axis) => self.absolute(axis, event.value()),
            InputEventKind::Key(key) => self.tool(key, event.value()),
            InputEventKind::Synchronization(Synchronization::SYN_REPORT) => return self.report(),
            InputEventKind::Synchronization(Synchronization::SYN_DROPPED) => {
                tracing::error!("Touchpad events were dropped by the kernel");
            }
            InputEventKind::Synchronization(_) => {}
            InputEventKind::Misc(MiscType::MSC_TIMESTAMP) => {}
            _ => tracing::error!(
                "Unhandled touchpad event: type {:?} code {} value {}",
                event.event_type(),
                event.code(),
                event.value()
            ),
        }
        None
    }

    fn absolute(&mut self, axis: AbsoluteAxisType, value: i32) {
        match axis {
            AbsoluteAxisType::ABS_MT_SLOT => self.current_slot = value,
            AbsoluteAxisType::ABS_MT_TRACKING_ID => {
                if value == -1 {
                    self.slots.remove(&self.current_slot);
                } else {
                    self.slots.insert(
                        self.current_slot,
                        SlotState {
                            id: value,
                            ..SlotState::default()
                        },
                    );
                }
            }
            AbsoluteAxisType::ABS_MT_POSITION_X => self.position(Some(value), None),
            AbsoluteAxisType::ABS_MT_POSITION_Y => self.position(None, Some(value)),
            AbsoluteAxisType::ABS_X
            | AbsoluteAxisType::ABS_Y
            | AbsoluteAxisType::ABS_PRESSURE
            | AbsoluteAxisType::ABS_TOOL_WIDTH
            | AbsoluteAxisType::ABS_MT_PRESSURE
            | AbsoluteAxisType::ABS_MT_TOOL_TYPE
            | AbsoluteAxisType::ABS_MT_TOUCH_MAJOR
            | AbsoluteAxisType::ABS_MT_TOUCH_MINOR
            | AbsoluteAxisType::ABS_MT_ORIENTATION
            | AbsoluteAxisType::ABS_MT_DISTANCE => {}
            other => tracing::error!("Unhandled touchpad axis {:?} = {}", other, value),
        }
    }

    fn position(&mut self, x: Option<i32>, y: Option<i32>) {
        let Some(slot) = self.slots.get_mut(&self.current_slot) else {
            return;
        };
        if x.is_some() {
            slot.x = x;
        }
        if y.is_some() {
            slot.y = y;
        }
        if slot.valid.is_none() {
            if let (Some(x), Some(y)) = (slot.x, slot.y) {
                slot.valid = Some(self.palm.is_valid(x, y));
            }
        }
    }

    fn tool(&mut self, key: Key, value: i32) {
        let pressed = value != 0;
        self.finger = match key {
            Key::BTN_TOOL_FINGER => u8::from(pressed),
            Key::BTN_TOOL_DOUBLETAP => if pressed { 2 } else { 1 },
            Key::BTN_TOOL_TRIPLETAP => if pressed { 3 } else { 2 },
            Key::BTN_TOOL_QUADTAP => if pressed { 4 } else { 3 },
            Key::BTN_TOOL_QUINTTAP => if pressed { 5 } else { 4 },
            // BTN_TOUCH and the physical buttons carry no touch identity
            _ => return,
        };
    }

    fn report(&mut self) -> Option<TouchpadFrame> {
        let status = u8::from(self.slots.values().any(|s| s.valid == Some(true)));
        if status == self.status {
            return None;
        }
        self.status = status;

        Some(TouchpadFrame {
            status,
            finger: self.finger,
            touch_state: self
                .slots
                .iter()
                .map(|(slot, state)| {
                    (
                        *slot,
                        SlotFrame {
                            id: state.id,
                            x: state.x,
                            y: state.y,
                            valid: state.valid.unwrap_or(false),
                        },
                    )
                })
                .collect(),
        })
    }
}

struct ObservedTouchpad {
    info: DeviceInfo,
    device: Device,
    decoder: TouchDecoder,
}

enum ReadOutcome {
    Continue,
    Removed,
    Fatal(i32),
}

/// Reads touchpads and forwards touch transitions to the host
pub struct TouchpadRemapper {
    selector: DeviceSelector<Device>,
    pads: Vec<ObservedTouchpad>,
    output: Option<VirtualTouchpad>,
    forward: File,
    teardown: Teardown,
}

impl TouchpadRemapper {
    pub fn new(patterns: &[String], forward: File) -> Self {
        Self {
            selector: DeviceSelector::evdev(
                "touchpad",
                patterns,
                &[VIRTUAL_KEYBOARD_NAME, VIRTUAL_TOUCHPAD_NAME],
            ),
            pads: Vec::new(),
            output: None,
            forward,
            teardown: Teardown::new(),
        }
    }

    /// Run until shutdown; returns the process exit status.
    pub fn run(mut self) -> i32 {
        if let Err(e) = self.open_touchpads() {
            tracing::error!("Failed to start touchpad remapper: {}", e);
            return self.destroy(EXIT_FAILURE);
        }

        loop {
            if let Some(code) = shutdown::requested_exit_code() {
                return self.destroy(code);
            }

            let fds: Vec<_> = self.pads.iter().map(|p| device_fd(&p.device)).collect();
            let ready = match wait_readable(&fds, POLL_INTERVAL) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!("Failed to poll touchpads: {}", e);
                    return self.destroy(EXIT_FAILURE);
                }
            };

            let mut removed = false;
            for index in 0..self.pads.len() {
                if !ready[index] {
                    continue;
                }
                match self.read_touchpad(index) {
                    ReadOutcome::Continue => {}
                    ReadOutcome::Removed => removed = true,
                    ReadOutcome::Fatal(code) => return self.destroy(code),
                }
            }

            if removed {
                if let Err(e) = self.reload() {
                    tracing::error!("Failed to reload touchpad: {}", e);
                    return self.destroy(EXIT_FAILURE);
                }
            }
        }
    }

    fn open_touchpads(&mut self) -> Result<(), InjectorError> {
        for (info, device) in self.selector.select(true) {
            tracing::info!("Observing touchpad '{}' ({})", info.name, info.path.display());
            let decoder = TouchDecoder::for_device(&device);
            self.pads.push(ObservedTouchpad {
                info,
                device,
                decoder,
            });
        }

        let Some(first) = self.pads.first() else {
            // interrupted while waiting
            return Ok(());
        };
        let axes: Vec<(AbsoluteAxisType, AxisRange)> = TOUCHPAD_AXES
            .iter()
            .filter_map(|axis| axis_range(&first.device, *axis).map(|range| (*axis, range)))
            .collect();
        self.output = Some(create_touchpad(
            VIRTUAL_TOUCHPAD_NAME,
            first.info.identity,
            &axes,
        )?);
        Ok(())
    }

    fn read_touchpad(&mut self, index: usize) -> ReadOutcome {
        let pad = &mut self.pads[index];
        let events: Vec<InputEvent> = match pad.device.fetch_events() {
            Ok(events) => events.collect(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadOutcome::Continue,
            Err(e) if e.raw_os_error() == Some(Errno::ENODEV as i32) => {
                return ReadOutcome::Removed
            }
            Err(e) => {
                tracing::error!("Failed to read touchpad '{}': {}", pad.info.name, e);
                return ReadOutcome::Fatal(EXIT_FAILURE);
            }
        };

        for event in events {
            let Some(frame) = pad.decoder.process(event) else {
                continue;
            };
            tracing::debug!(
                "Touch {} with {} finger(s) on '{}'",
                if frame.status == 1 { "began" } else { "ended" },
                frame.finger,
                pad.info.name
            );
            if let Err(e) = write_frame(&mut self.forward, &frame) {
                tracing::error!("Failed to forward touch state: {}", e);
                return ReadOutcome::Fatal(EXIT_FAILURE);
            }
        }
        ReadOutcome::Continue
    }

    /// Block until a touchpad is back, then rebuild the virtual touchpad.
    fn reload(&mut self) -> Result<(), InjectorError> {
        if let Some(mut output) = self.output.take() {
            output.destroy()?;
        }
        self.pads.clear();
        tracing::warn!("Touchpad device is removed");
        tracing::info!("Waiting for touchpad to reconnect...");

        self.selector.reset();
        self.open_touchpads()?;
        if !self.pads.is_empty() {
            tracing::info!("Touchpad reconnected");
        }
        Ok(())
    }

    fn destroy(&mut self, code: i32) -> i32 {
        if !self.teardown.begin() {
            return code;
        }
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.destroy() {
                tracing::warn!("{}", e);
            }
        }
        self.pads.clear();
        tracing::info!("Touchpad remapper stopped");
        code
    }
}
