//! Error types for mandelbox-core.

use thiserror::Error;

/// Result type alias for mandelbox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while allocating resources or managing mandelboxes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No free port/TTY/GPU slot after bounded retries
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Disallowed port, unknown protocol, empty required field, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource or registration already taken
    #[error("already allocated: {0}")]
    AlreadyAllocated(String),

    /// Free of something that is not held
    #[error("not allocated: {0}")]
    NotAllocated(String),

    /// One of several requested resources failed; its siblings were released
    #[error("allocation rolled back after {failed}: {source}")]
    PartialAllocationRolledBack {
        /// Description of the request that failed
        failed: String,
        /// Why it failed
        #[source]
        source: Box<CoreError>,
    },

    /// A collaborator (runtime, database, storage) call failed
    #[error("{collaborator} failure: {message}")]
    External {
        /// Which collaborator failed
        collaborator: &'static str,
        /// Error message from the collaborator
        message: String,
    },

    /// The host is draining and accepts no new mandelboxes
    #[error("host is draining")]
    Draining,

    /// Mandelbox not found
    #[error("mandelbox not found: {0}")]
    NotFound(String),

    /// Waited too long for something
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The mandelbox or host was cancelled while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Error from mandelbox-input
    #[error("input device error: {0}")]
    Input(#[from] mandelbox_input::InputError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Shorthand for an [`CoreError::External`] error.
    pub fn external(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::External {
            collaborator,
            message: message.into(),
        }
    }

    /// Whether the error means the host is out of some resource.
    pub fn is_capacity(&self) -> bool {
        match self {
            Self::CapacityExhausted(_) | Self::Draining => true,
            Self::PartialAllocationRolledBack { source, .. } => source.is_capacity(),
            _ => false,
        }
    }
}
