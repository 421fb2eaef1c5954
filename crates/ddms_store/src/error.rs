//! Error types reported by the backing sync engines.

use ddms_core::GeneralError;
use thiserror::Error;

/// Result type for engine delegate calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Status reported by a KV or relational sync engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The cloud could not be reached.
    #[error("cloud network error")]
    CloudNetwork,

    /// Another process holds the cloud lock.
    #[error("cloud lock held by another process")]
    CloudLock,

    /// The cloud refused more records.
    #[error("cloud record limit reached")]
    CloudFullRecords,

    /// No space left for downloaded assets.
    #[error("insufficient space for cloud assets")]
    CloudAssetSpaceInsufficient,

    /// An equivalent cloud task is already queued.
    #[error("cloud sync task merged")]
    CloudSyncTaskMerged,

    /// The engine is busy with another operation.
    #[error("engine busy")]
    Busy,

    /// The engine rejected the arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The requested store or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The database handle was already closed.
    #[error("database closed")]
    Closed,

    /// Any other database failure.
    #[error("database error: {0}")]
    Db(String),
}

impl EngineError {
    /// Creates an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        EngineError::InvalidArgs(message.into())
    }

    /// Creates a generic database error.
    pub fn db(message: impl Into<String>) -> Self {
        EngineError::Db(message.into())
    }
}

impl From<EngineError> for GeneralError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CloudNetwork => GeneralError::NetworkError,
            EngineError::CloudLock => GeneralError::LockedByOthers,
            EngineError::CloudFullRecords => GeneralError::RecordLimitExceeded,
            EngineError::CloudAssetSpaceInsufficient => GeneralError::NoSpaceForAsset,
            EngineError::CloudSyncTaskMerged => GeneralError::SyncTaskMerged,
            EngineError::Busy => GeneralError::Busy,
            other => {
                tracing::debug!(status = %other, "unmapped engine status");
                GeneralError::Error
            }
        }
    }
}

/// Maps an engine status onto the store status taxonomy.
pub fn convert_status(status: &EngineResult<()>) -> Result<(), GeneralError> {
    match status {
        Ok(()) => Ok(()),
        Err(err) => Err(GeneralError::from(err.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(EngineError::CloudLock.to_string(), "cloud lock held by another process");
        assert_eq!(
            EngineError::invalid_args("empty query").to_string(),
            "invalid arguments: empty query"
        );
        assert_eq!(EngineError::db("io").to_string(), "database error: io");
    }

    #[test]
    fn status_conversion() {
        assert_eq!(convert_status(&Ok(())), Ok(()));
        let cases = [
            (EngineError::CloudNetwork, GeneralError::NetworkError),
            (EngineError::CloudLock, GeneralError::LockedByOthers),
            (EngineError::CloudFullRecords, GeneralError::RecordLimitExceeded),
            (EngineError::CloudAssetSpaceInsufficient, GeneralError::NoSpaceForAsset),
            (EngineError::CloudSyncTaskMerged, GeneralError::SyncTaskMerged),
            (EngineError::Busy, GeneralError::Busy),
            (EngineError::Closed, GeneralError::Error),
            (EngineError::db("x"), GeneralError::Error),
        ];
        for (engine, general) in cases {
            assert_eq!(convert_status(&Err(engine)), Err(general));
        }
    }
}
