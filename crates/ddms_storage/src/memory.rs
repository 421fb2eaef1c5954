//! In-memory key-value delegate for testing.

use crate::delegate::{KvDelegate, KvEntry};
use crate::error::{StorageError, StorageResult};
use crate::transaction::{KvState, Mutation};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory key-value delegate.
///
/// Suitable for unit tests, integration tests and stores that do not need
/// to survive a restart. Writes can be made to fail on demand to exercise
/// the error paths of callers.
///
/// # Example
///
/// ```rust
/// use ddms_storage::{KvDelegate, MemoryKvDelegate};
///
/// let delegate = MemoryKvDelegate::new();
/// delegate.start_transaction().unwrap();
/// delegate.put(b"k", b"v").unwrap();
/// delegate.rollback().unwrap();
/// assert_eq!(delegate.get(b"k").unwrap(), None);
/// ```
#[derive(Debug, Default)]
pub struct MemoryKvDelegate {
    state: RwLock<KvState>,
    reject_writes: AtomicBool,
}

impl MemoryKvDelegate {
    /// Creates a new empty delegate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`StorageError::WriteRejected`].
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Returns the number of committed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Returns true if no key is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, mutation: Mutation) -> StorageResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::write_rejected("writes disabled"));
        }
        let mut state = self.state.write();
        state.ensure_open()?;
        if let Some(mutation) = state.write(mutation) {
            state.apply(mutation);
        }
        Ok(())
    }
}

impl KvDelegate for MemoryKvDelegate {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.get(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.write(Mutation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.write(Mutation::Delete { key: key.to_vec() })
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self
            .entries_with_prefix(prefix)?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }

    fn entries_with_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KvEntry>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.entries_with_prefix(prefix))
    }

    fn start_transaction(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.begin()
    }

    fn commit(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let staged = state.take_staged()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::write_rejected("writes disabled"));
        }
        for mutation in staged {
            state.apply(mutation);
        }
        Ok(())
    }

    fn rollback(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.take_staged().map(|_| ())
    }

    fn close(&self) -> StorageResult<()> {
        self.state.write().close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let delegate = MemoryKvDelegate::new();
        assert!(delegate.is_empty());
        assert_eq!(delegate.get(b"missing").unwrap(), None);
    }

    #[test]
    fn memory_put_get_delete() {
        let delegate = MemoryKvDelegate::new();
        delegate.put(b"a", b"1").unwrap();
        delegate.put(b"a", b"2").unwrap();
        assert_eq!(delegate.get(b"a").unwrap(), Some(b"2".to_vec()));

        delegate.delete(b"a").unwrap();
        assert_eq!(delegate.get(b"a").unwrap(), None);
        delegate.delete(b"a").unwrap();
    }

    #[test]
    fn memory_prefix_is_bytewise() {
        let delegate = MemoryKvDelegate::new();
        delegate.put(b"CLOUD_INFO###100", b"x").unwrap();
        delegate.put(b"CLOUD_INFO###1000", b"y").unwrap();
        delegate.put(b"CLOUD_SCHEMA###100", b"z").unwrap();

        let keys = delegate.keys_with_prefix(b"CLOUD_INFO###100").unwrap();
        assert_eq!(keys.len(), 2);
        let keys = delegate.keys_with_prefix(b"CLOUD_").unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn memory_commit_applies_all() {
        let delegate = MemoryKvDelegate::new();
        delegate.put(b"old", b"0").unwrap();
        delegate.start_transaction().unwrap();
        delegate.put(b"a", b"1").unwrap();
        delegate.delete(b"old").unwrap();
        assert_eq!(delegate.len(), 1);
        delegate.commit().unwrap();

        assert_eq!(delegate.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(delegate.get(b"old").unwrap(), None);
    }

    #[test]
    fn memory_rejected_commit_leaves_data_untouched() {
        let delegate = MemoryKvDelegate::new();
        delegate.start_transaction().unwrap();
        delegate.put(b"a", b"1").unwrap();
        delegate.set_reject_writes(true);
        assert!(matches!(
            delegate.commit(),
            Err(StorageError::WriteRejected(_))
        ));
        delegate.set_reject_writes(false);
        assert_eq!(delegate.get(b"a").unwrap(), None);
    }

    #[test]
    fn memory_closed_rejects_calls() {
        let delegate = MemoryKvDelegate::new();
        delegate.close().unwrap();
        assert!(delegate.is_closed());
        assert!(matches!(delegate.get(b"a"), Err(StorageError::Closed)));
        assert!(matches!(delegate.put(b"a", b"1"), Err(StorageError::Closed)));
        delegate.close().unwrap();
    }
}
