//! Key-value delegate trait definition.

use crate::error::StorageResult;

/// A key together with its stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The key bytes.
    pub key: Vec<u8>,
    /// The value bytes.
    pub value: Vec<u8>,
}

/// An ordered key-value engine used by the metadata store.
///
/// Delegates do not understand the records they hold. Callers own
/// serialization, key layout and change notification.
///
/// # Invariants
///
/// - `get` after `put` on the same key returns the written value
/// - `delete` of a missing key succeeds
/// - prefix scans compare raw bytes and return keys in ascending order
/// - between `start_transaction` and `commit`, reads observe staged writes
///   and nothing is durable until `commit` returns
/// - after `close`, every method fails with [`crate::StorageError::Closed`]
///
/// # Implementors
///
/// - [`super::MemoryKvDelegate`] - For testing
/// - [`super::FileKvDelegate`] - For persistent storage
pub trait KvDelegate: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Writes `value` under `key`, replacing any existing value.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Returns every key starting with `prefix`, in ascending byte order.
    fn keys_with_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>>;

    /// Returns every entry whose key starts with `prefix`, in ascending key order.
    fn entries_with_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KvEntry>>;

    /// Starts staging writes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::TransactionActive`] if one is already running.
    fn start_transaction(&self) -> StorageResult<()>;

    /// Applies all staged writes atomically.
    fn commit(&self) -> StorageResult<()>;

    /// Discards all staged writes.
    fn rollback(&self) -> StorageResult<()>;

    /// Closes the delegate. Closing twice is a no-op.
    fn close(&self) -> StorageResult<()>;

    /// Returns true once the delegate has been closed.
    fn is_closed(&self) -> bool;
}
