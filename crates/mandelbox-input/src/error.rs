//! Error types for mandelbox-input.

use crate::DeviceKind;
use thiserror::Error;

/// Result type alias for mandelbox-input operations.
pub type Result<T> = std::result::Result<T, InputError>;

/// Errors that can occur while managing virtual input devices.
#[derive(Debug, Error)]
pub enum InputError {
    /// Failed to create one of the devices of a set
    #[error("failed to create {kind} device: {reason}")]
    Create {
        /// Which device of the set failed
        kind: DeviceKind,
        /// Underlying cause
        reason: String,
    },

    /// An ioctl on the uinput control file failed
    #[error("uinput ioctl {op} failed: {source}")]
    Ioctl {
        /// Name of the ioctl
        op: &'static str,
        /// Errno returned by the kernel
        #[source]
        source: nix::Error,
    },

    /// The device node for a freshly created device never showed up in sysfs
    #[error("device node not found for {0}")]
    NodeNotFound(String),

    /// Sending descriptors over the handoff socket failed
    #[error("descriptor handoff failed: {0}")]
    Handoff(String),

    /// The operation was cancelled before a client connected
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
