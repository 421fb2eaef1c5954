//! Error types for the daemon.

use ddms_cloud::CloudError;
use ddms_storage::StorageError;
use thiserror::Error;

/// Result type for daemon setup.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised while building or running the services.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A metadata journal could not be opened.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The cloud service refused to start.
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
}
