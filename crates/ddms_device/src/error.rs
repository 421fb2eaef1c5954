//! Error types for the device registry.

use thiserror::Error;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur talking to the device manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform device manager rejected a call.
    #[error("device manager error {code}: {message}")]
    Transport {
        /// Platform status code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// The platform device manager is not reachable yet.
    #[error("device manager not ready")]
    NotReady,

    /// The listener is not registered.
    #[error("listener not registered")]
    UnknownListener,
}

impl DeviceError {
    /// Creates a transport error.
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        DeviceError::Transport {
            code,
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::NotReady | DeviceError::Transport { .. })
    }
}
