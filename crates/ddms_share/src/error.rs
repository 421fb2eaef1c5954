//! Error types for the subscriber registries.

use ddms_core::MetaError;
use thiserror::Error;

/// Result type for subscriber registry operations.
pub type ShareResult<T> = Result<T, ShareError>;

/// Errors returned by the subscriber registries.
#[derive(Error, Debug)]
pub enum ShareError {
    /// No observer is registered under the key.
    #[error("subscriber does not exist")]
    SubscriberNotExist,

    /// No template is registered under the key.
    #[error("template does not exist")]
    TemplateNotExist,

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing data source refused a statement.
    #[error("data source error: {0}")]
    DataSource(String),

    /// Template metadata could not be read or written.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
}

impl ShareError {
    /// Creates a data source error.
    pub fn data_source(message: impl Into<String>) -> Self {
        ShareError::DataSource(message.into())
    }
}
