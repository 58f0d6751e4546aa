//! Device set abstraction shared by every provider.
//!
//! A [`DeviceSet`] always holds exactly three live devices. It is built
//! through [`DeviceSet::build`], which closes whatever it already created if
//! a later device fails, so a half-initialized set never escapes.

use crate::error::{InputError, Result};
use serde::Serialize;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// The three kinds of virtual input device handed to a mandelbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Pointer reporting absolute coordinates (tablet-style).
    AbsolutePointer,
    /// Pointer reporting relative motion (mouse-style).
    RelativePointer,
    /// Keyboard.
    Keyboard,
}

impl DeviceKind {
    /// All kinds, in creation order.
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::AbsolutePointer,
        DeviceKind::RelativePointer,
        DeviceKind::Keyboard,
    ];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AbsolutePointer => write!(f, "absolute pointer"),
            Self::RelativePointer => write!(f, "relative pointer"),
            Self::Keyboard => write!(f, "keyboard"),
        }
    }
}

/// One OS-level virtual input device.
///
/// Implementations own the underlying file descriptor. `close` tears the
/// device down; dropping without `close` only releases the descriptor.
pub trait InputDevice: AsFd + fmt::Debug + Send + Sync {
    /// Which device of the set this is.
    fn kind(&self) -> DeviceKind;

    /// Path of the device node to expose inside the container.
    fn node_path(&self) -> &Path;

    /// Destroy the device and release its descriptor.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Capability for creating device sets.
///
/// All platform-specific code lives behind this trait.
pub trait InputDeviceProvider: Send + Sync {
    /// Create a full set of three devices, or none at all.
    fn allocate(&self) -> Result<DeviceSet>;
}

/// Device node paths of a set, as mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePaths {
    pub absolute_pointer: PathBuf,
    pub relative_pointer: PathBuf,
    pub keyboard: PathBuf,
}

impl DevicePaths {
    /// Iterate over `(kind, path)` pairs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceKind, &Path)> {
        [
            (DeviceKind::AbsolutePointer, self.absolute_pointer.as_path()),
            (DeviceKind::RelativePointer, self.relative_pointer.as_path()),
            (DeviceKind::Keyboard, self.keyboard.as_path()),
        ]
        .into_iter()
    }
}

/// Close the devices of a partially built set and hand back `error`.
fn rollback(kind: DeviceKind, created: Vec<Box<dyn InputDevice>>, error: InputError) -> InputError {
    tracing::warn!(
        kind = %kind,
        already_created = created.len(),
        error = %error,
        "Device creation failed, closing partial set"
    );
    for device in created {
        let device_kind = device.kind();
        if let Err(close_err) = device.close() {
            tracing::error!(
                kind = %device_kind,
                error = %close_err,
                "Failed to close device during rollback"
            );
        }
    }
    error
}

/// A complete triple of virtual input devices for one mandelbox.
#[derive(Debug)]
pub struct DeviceSet {
    absolute_pointer: Box<dyn InputDevice>,
    relative_pointer: Box<dyn InputDevice>,
    keyboard: Box<dyn InputDevice>,
}

impl DeviceSet {
    /// Create the three devices in order using `create`.
    ///
    /// If any creation fails, every device already created by this call is
    /// closed before the error is returned.
    pub fn build<F>(mut create: F) -> Result<Self>
    where
        F: FnMut(DeviceKind) -> Result<Box<dyn InputDevice>>,
    {
        let absolute_pointer = create(DeviceKind::AbsolutePointer)?;
        let relative_pointer = match create(DeviceKind::RelativePointer) {
            Ok(device) => device,
            Err(e) => return Err(rollback(DeviceKind::RelativePointer, vec![absolute_pointer], e)),
        };
        let keyboard = match create(DeviceKind::Keyboard) {
            Ok(device) => device,
            Err(e) => {
                return Err(rollback(
                    DeviceKind::Keyboard,
                    vec![absolute_pointer, relative_pointer],
                    e,
                ))
            }
        };

        Ok(Self {
            absolute_pointer,
            relative_pointer,
            keyboard,
        })
    }

    /// Device node paths of all three devices.
    pub fn paths(&self) -> DevicePaths {
        DevicePaths {
            absolute_pointer: self.absolute_pointer.node_path().to_path_buf(),
            relative_pointer: self.relative_pointer.node_path().to_path_buf(),
            keyboard: self.keyboard.node_path().to_path_buf(),
        }
    }

    /// Raw descriptors in the order the container expects them:
    /// absolute pointer, relative pointer, keyboard.
    pub fn raw_fds(&self) -> [RawFd; 3] {
        [
            self.absolute_pointer.as_fd().as_raw_fd(),
            self.relative_pointer.as_fd().as_raw_fd(),
            self.keyboard.as_fd().as_raw_fd(),
        ]
    }

    /// Destroy all three devices.
    ///
    /// Every device is closed even if an earlier one fails; the first error
    /// is returned.
    pub fn close(self) -> Result<()> {
        let mut first_err = None;
        for device in [self.absolute_pointer, self.relative_pointer, self.keyboard] {
            let kind = device.kind();
            if let Err(e) = device.close() {
                tracing::warn!(kind = %kind, error = %e, "Failed to close input device");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInputProvider;

    #[test]
    fn test_build_creates_all_three() {
        let provider = FakeInputProvider::new();
        let set = provider.allocate().expect("allocation should succeed");
        assert_eq!(provider.open_devices(), 3);

        let paths = set.paths();
        let kinds: Vec<DeviceKind> = paths.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, DeviceKind::ALL.to_vec());

        set.close().unwrap();
        assert_eq!(provider.open_devices(), 0);
    }

    #[test]
    fn test_build_rolls_back_on_failure() {
        let provider = FakeInputProvider::failing_at(DeviceKind::Keyboard);
        let result = provider.allocate();
        assert!(result.is_err());
        // The two pointers created before the keyboard must be closed again
        assert_eq!(provider.open_devices(), 0);
        assert_eq!(provider.created_total(), 2);
    }

    #[test]
    fn test_build_rolls_back_middle_failure() {
        let provider = FakeInputProvider::failing_at(DeviceKind::RelativePointer);
        assert!(provider.allocate().is_err());
        assert_eq!(provider.open_devices(), 0);
        assert_eq!(provider.created_total(), 1);
    }

    #[test]
    fn test_raw_fds_are_distinct() {
        let provider = FakeInputProvider::new();
        let set = provider.allocate().unwrap();
        let fds = set.raw_fds();
        assert_ne!(fds[0], fds[1]);
        assert_ne!(fds[1], fds[2]);
        assert_ne!(fds[0], fds[2]);
        set.close().unwrap();
    }

    #[test]
    fn test_device_kind_display() {
        assert_eq!(DeviceKind::AbsolutePointer.to_string(), "absolute pointer");
        assert_eq!(DeviceKind::Keyboard.to_string(), "keyboard");
    }
}
