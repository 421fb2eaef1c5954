//! Error types shared across DDMS features.

use ddms_storage::StorageError;
use thiserror::Error;

/// Result type for store and sync operations.
pub type StoreResult<T> = Result<T, GeneralError>;

/// Result type for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// How callers should react to a [`GeneralError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Worth retrying after a backoff.
    Transient,
    /// Returned immediately, never retried.
    Permanent,
    /// Peers or metadata disagree; the caller decides whether to re-provision.
    Consistency,
    /// A quota or space limit was hit.
    ResourceExhausted,
}

/// Status of a store or sync operation.
///
/// Success is expressed as `Ok(..)`; every variant here is a failure that
/// may travel through async callbacks, so the type is `Copy`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneralError {
    /// Unclassified failure.
    #[error("general error")]
    Error,
    /// Local contention, try again shortly.
    #[error("store is busy")]
    Busy,
    /// The caller passed an invalid argument.
    #[error("invalid arguments")]
    InvalidArgs,
    /// A required component has not been initialized.
    #[error("not initialized")]
    NotInit,
    /// The operation is not supported by this store.
    #[error("not supported")]
    NotSupport,
    /// The backing engine is not open or already closed.
    #[error("store already closed")]
    AlreadyClosed,
    /// Cloud or the bundle switch is turned off.
    #[error("cloud sync is not opened")]
    Unopened,
    /// Waiting for a prerequisite (for example the schema) timed out.
    #[error("retry timeout")]
    RetryTimeout,
    /// The network is unreachable.
    #[error("network error")]
    NetworkError,
    /// Cloud is disabled for the account.
    #[error("cloud disabled")]
    CloudDisabled,
    /// An equivalent sync task is already in flight.
    #[error("sync task merged")]
    SyncTaskMerged,
    /// Another process holds the cloud lock.
    #[error("locked by others")]
    LockedByOthers,
    /// The cloud record limit was exceeded.
    #[error("record limit exceeded")]
    RecordLimitExceeded,
    /// There is no space left to download assets.
    #[error("no space for asset")]
    NoSpaceForAsset,
    /// The caller lacks permission.
    #[error("permission denied")]
    PermissionDenied,
    /// Peers disagree on a table schema.
    #[error("schema incompatible")]
    SchemaIncompatible,
    /// Store metadata is missing or unreadable.
    #[error("store metadata missing")]
    MetaMissing,
    /// The data was changed concurrently by another writer.
    #[error("version conflict")]
    VersionConflict,
}

impl GeneralError {
    /// Returns the class used by retry and propagation policies.
    pub fn class(&self) -> ErrorClass {
        match self {
            GeneralError::NetworkError
            | GeneralError::LockedByOthers
            | GeneralError::Busy
            | GeneralError::SyncTaskMerged
            | GeneralError::RetryTimeout => ErrorClass::Transient,
            GeneralError::SchemaIncompatible
            | GeneralError::MetaMissing
            | GeneralError::VersionConflict => ErrorClass::Consistency,
            GeneralError::RecordLimitExceeded | GeneralError::NoSpaceForAsset => {
                ErrorClass::ResourceExhausted
            }
            _ => ErrorClass::Permanent,
        }
    }

    /// Returns true if a retry may succeed.
    ///
    /// A merged task is transient but never retried: the in-flight task
    /// already covers the request.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient && *self != GeneralError::SyncTaskMerged
    }
}

/// Errors raised by the metadata layer.
#[derive(Error, Debug)]
pub enum MetaError {
    /// The backing delegate failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be serialized.
    #[error("failed to encode {key}: {message}")]
    Encode {
        /// Key being written.
        key: String,
        /// Serializer message.
        message: String,
    },

    /// A stored record could not be deserialized.
    #[error("failed to decode {key}: {message}")]
    Decode {
        /// Key being read.
        key: String,
        /// Deserializer message.
        message: String,
    },

    /// The delegate stayed unavailable for every retry.
    #[error("metadata store not ready after {attempts} attempts")]
    NotReady {
        /// Number of open attempts made.
        attempts: u32,
    },
}

impl From<MetaError> for GeneralError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::Decode { .. } => GeneralError::MetaMissing,
            MetaError::NotReady { .. } => GeneralError::NotInit,
            MetaError::Storage(_) | MetaError::Encode { .. } => GeneralError::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(GeneralError::NetworkError.is_retryable());
        assert!(GeneralError::LockedByOthers.is_retryable());
        assert!(GeneralError::Busy.is_retryable());
        assert!(!GeneralError::SyncTaskMerged.is_retryable());
        assert!(!GeneralError::InvalidArgs.is_retryable());
        assert!(!GeneralError::RecordLimitExceeded.is_retryable());
    }

    #[test]
    fn error_classes() {
        assert_eq!(GeneralError::SyncTaskMerged.class(), ErrorClass::Transient);
        assert_eq!(GeneralError::NotSupport.class(), ErrorClass::Permanent);
        assert_eq!(GeneralError::SchemaIncompatible.class(), ErrorClass::Consistency);
        assert_eq!(
            GeneralError::NoSpaceForAsset.class(),
            ErrorClass::ResourceExhausted
        );
    }

    #[test]
    fn meta_error_maps_to_general() {
        let err = MetaError::NotReady { attempts: 3 };
        assert_eq!(err.to_string(), "metadata store not ready after 3 attempts");
        assert_eq!(GeneralError::from(err), GeneralError::NotInit);
        assert_eq!(
            GeneralError::from(MetaError::Storage(StorageError::Closed)),
            GeneralError::Error
        );
    }
}
