//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal contains a record that cannot be decoded.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// A record could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The delegate has been closed.
    #[error("delegate is closed")]
    Closed,

    /// Another process holds the journal lock.
    #[error("journal {0} is locked by another process")]
    Locked(PathBuf),

    /// A transaction is already running on this delegate.
    #[error("a transaction is already active")]
    TransactionActive,

    /// Commit or rollback was called without a running transaction.
    #[error("no active transaction")]
    NoTransaction,

    /// The engine refused the write (disk full, read-only volume, injected fault).
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    /// Creates a write-rejected error.
    pub fn write_rejected(message: impl Into<String>) -> Self {
        Self::WriteRejected(message.into())
    }

    /// Returns true if reopening the delegate may make the operation succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Closed | StorageError::Locked(_))
    }
}
