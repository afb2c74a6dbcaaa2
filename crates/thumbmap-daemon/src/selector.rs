//! Finding and opening devices by name

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use evdev::Device;
use nix::errno::Errno;

use crate::device::{DeviceCatalog, DeviceInfo, EvdevCatalog};
use crate::matcher::NamePattern;
use crate::shutdown;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub type Opener<H> = Box<dyn FnMut(&DeviceInfo) -> io::Result<H>>;

/// Selects devices whose name matches any configured pattern
///
/// Without patterns, every device of the catalog's default class (touchpads)
/// is selected. Synthetic devices created by this daemon are always skipped.
pub struct DeviceSelector<H> {
    label: &'static str,
    catalog: Box<dyn DeviceCatalog>,
    patterns: Option<Vec<NamePattern>>,
    excluded_names: Vec<String>,
    poll_interval: Duration,
    open: Opener<H>,
}

impl DeviceSelector<Device> {
    pub fn evdev(label: &'static str, patterns: &[String], excluded_names: &[&str]) -> Self {
        Self::new(
            label,
            Box::new(EvdevCatalog::new()),
            patterns,
            excluded_names,
            Box::new(|info: &DeviceInfo| Device::open(&info.path)),
        )
    }
}

impl<H> DeviceSelector<H> {
    pub fn new(
        label: &'static str,
        catalog: Box<dyn DeviceCatalog>,
        patterns: &[String],
        excluded_names: &[&str],
        open: Opener<H>,
    ) -> Self {
        let patterns = if patterns.is_empty() {
            None
        } else {
            Some(patterns.iter().map(|p| NamePattern::new(p)).collect())
        };
        Self {
            label,
            catalog,
            patterns,
            excluded_names: excluded_names.iter().map(|n| n.to_string()).collect(),
            poll_interval: POLL_INTERVAL,
            open,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Device infos that match, without opening anything.
    pub fn candidates(&mut self) -> Vec<DeviceInfo> {
        let listed = match &self.patterns {
            Some(patterns) => self
                .catalog
                .list_all()
                .into_iter()
                .filter(|d| patterns.iter().any(|p| p.is_match(&d.name)))
                .collect(),
            None => self.catalog.list_available_default_class(),
        };
        listed
            .into_iter()
            .filter(|d| !self.excluded_names.iter().any(|n| *n == d.name))
            .collect()
    }

    /// Open every matching device.
    ///
    /// With `wait`, polls the catalog until at least one device opens,
    /// logging the waiting notice once.
    pub fn select(&mut self, wait: bool) -> Vec<(DeviceInfo, H)> {
        self.select_excluding(wait, &[])
    }

    /// Like [`DeviceSelector::select`], skipping devices already held at `known` paths.
    ///
    /// A pending termination signal ends the wait with an empty result.
    pub fn select_excluding(&mut self, wait: bool, known: &[PathBuf]) -> Vec<(DeviceInfo, H)> {
        let mut announced = false;
        loop {
            let opened = self.open_candidates(known);
            if !opened.is_empty() || !wait || shutdown::requested_exit_code().is_some() {
                return opened;
            }

            if !announced {
                tracing::warn!("No {} found", self.label);
                tracing::info!("Waiting for {} to be connected...", self.label);
                announced = true;
            }
            thread::sleep(self.poll_interval);
            self.catalog.reset();
        }
    }

    /// Forget cached listings, e.g. after a device was removed.
    pub fn reset(&mut self) {
        self.catalog.reset();
    }

    fn open_candidates(&mut self, known: &[PathBuf]) -> Vec<(DeviceInfo, H)> {
        let mut opened = Vec::new();
        for info in self.candidates() {
            if known.contains(&info.path) {
                continue;
            }
            match (self.open)(&info) {
                Ok(handle) => opened.push((info, handle)),
                Err(e) if is_transient(&e) => {
                    tracing::warn!(
                        "Skipping {} '{}' ({}): {}",
                        self.label,
                        info.name,
                        info.path.display(),
                        e
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to open {} '{}' ({}): {}",
                        self.label,
                        info.name,
                        info.path.display(),
                        e
                    );
                }
            }
        }
        opened
    }
}

/// Open/grab/read errors that are recovered by skipping or reloading.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOENT | Errno::ENODEV | Errno::EACCES | Errno::EBUSY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HwIdentity;
    use evdev::BusType;

    struct FakeCatalog {
        devices: Vec<DeviceInfo>,
    }

    impl DeviceCatalog for FakeCatalog {
        fn list_all(&mut self) -> Vec<DeviceInfo> {
            self.devices.clone()
        }

        fn reset(&mut self) {}
    }

    fn info(path: &str, name: &str, is_touchpad: bool) -> DeviceInfo {
        DeviceInfo {
            path: PathBuf::from(path),
            name: name.to_string(),
            identity: HwIdentity {
                bus: BusType::BUS_USB,
                vendor: 1,
                product: 2,
                version: 3,
            },
            is_keyboard: !is_touchpad,
            is_touchpad,
        }
    }

    fn catalog() -> Box<dyn DeviceCatalog> {
        Box::new(FakeCatalog {
            devices: vec![
                info("/dev/input/event0", "AT Translated Set 2 keyboard", false),
                info("/dev/input/event1", "thumbmap_virtual_keyboard", false),
                info("/dev/input/event2", "SynPS/2 Synaptics TouchPad", true),
                info("/dev/input/event3", "Broken Keyboard", false),
            ],
        })
    }

    fn opener() -> Opener<PathBuf> {
        Box::new(|info: &DeviceInfo| {
            if info.name.starts_with("Broken") {
                Err(io::Error::from_raw_os_error(Errno::EACCES as i32))
            } else {
                Ok(info.path.clone())
            }
        })
    }

    #[test]
    fn test_patterns_skip_own_device_and_open_failures() {
        let mut selector = DeviceSelector::new(
            "keyboard",
            catalog(),
            &["KEYBOARD".to_string()],
            &["thumbmap_virtual_keyboard"],
            opener(),
        );

        let selected = selector.select(false);
        let paths: Vec<_> = selected.iter().map(|(_, path)| path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/dev/input/event0")]);
    }

    #[test]
    fn test_default_class_without_patterns() {
        let mut selector = DeviceSelector::new("touchpad", catalog(), &[], &[], opener());

        let selected = selector.select(false);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.name, "SynPS/2 Synaptics TouchPad");
    }

    #[test]
    fn test_known_paths_are_not_reopened() {
        let mut selector = DeviceSelector::new(
            "keyboard",
            catalog(),
            &["keyboard".to_string()],
            &[],
            opener(),
        );

        let selected =
            selector.select_excluding(false, &[PathBuf::from("/dev/input/event0")]);
        let names: Vec<_> = selected.iter().map(|(info, _)| info.name.as_str()).collect();
        assert_eq!(names, vec!["thumbmap_virtual_keyboard"]);
    }

    #[test]
    fn test_no_wait_returns_empty() {
        let mut selector = DeviceSelector::new(
            "keyboard",
            catalog(),
            &["HHKB".to_string()],
            &[],
            opener(),
        )
        .with_poll_interval(Duration::from_millis(1));

        assert!(selector.select(false).is_empty());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::ENODEV as i32)));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::EBUSY as i32)));
        assert!(!is_transient(&io::Error::from_raw_os_error(Errno::EINVAL as i32)));
    }
}
