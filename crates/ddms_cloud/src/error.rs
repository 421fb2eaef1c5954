//! Error types for the cloud service.

use ddms_core::{GeneralError, MetaError};
use thiserror::Error;

/// Result type for cloud service operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors returned by [`CloudService`](crate::CloudService) operations.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The caller passed an argument that does not match the stored state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cloud sync is turned off for the account.
    #[error("cloud is disabled")]
    CloudDisabled,

    /// The cloud switch of a bundle is off.
    #[error("cloud switch of {0} is off")]
    SwitchOff(String),

    /// Neither the metadata nor the server knows the user's cloud account.
    #[error("no cloud info for user {0}")]
    NoCloudInfo(i32),

    /// A bundle has no stored cloud schema.
    #[error("no cloud schema for {0}")]
    SchemaMissing(String),

    /// No cloud server is attached to the service.
    #[error("cloud server unavailable")]
    ServerUnavailable,

    /// Metadata could not be read or written.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// A store or sync operation failed.
    #[error("store error: {0}")]
    Store(#[from] GeneralError),
}

impl CloudError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CloudError::InvalidArgument(message.into())
    }
}
