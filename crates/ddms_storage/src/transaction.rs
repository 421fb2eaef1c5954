//! Shared map state with a staging overlay for transactions.

use crate::delegate::KvEntry;
use crate::error::{StorageError, StorageResult};
use std::collections::BTreeMap;

/// A single mutation, as staged or as written to the journal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub(crate) fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

/// The committed map plus an optional staged overlay.
#[derive(Debug, Default)]
pub(crate) struct KvState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    staged: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    closed: bool,
}

impl KvState {
    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.staged = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(staged) = &self.staged {
            if let Some(value) = staged.get(key) {
                return value.clone();
            }
        }
        self.data.get(key).cloned()
    }

    pub(crate) fn entries_with_prefix(&self, prefix: &[u8]) -> Vec<KvEntry> {
        let mut merged: BTreeMap<&[u8], &[u8]> = self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
            .collect();
        if let Some(staged) = &self.staged {
            for (key, value) in staged.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                match value {
                    Some(value) => merged.insert(key.as_slice(), value.as_slice()),
                    None => merged.remove(key.as_slice()),
                };
            }
        }
        merged
            .into_iter()
            .map(|(key, value)| KvEntry {
                key: key.to_vec(),
                value: value.to_vec(),
            })
            .collect()
    }

    /// Stages the mutation if a transaction runs, otherwise applies it.
    /// Returns the mutation when it must be persisted right away.
    pub(crate) fn write(&mut self, mutation: Mutation) -> Option<Mutation> {
        if let Some(staged) = &mut self.staged {
            match mutation {
                Mutation::Put { key, value } => staged.insert(key, Some(value)),
                Mutation::Delete { key } => staged.insert(key, None),
            };
            return None;
        }
        Some(mutation)
    }

    pub(crate) fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Put { key, value } => {
                self.data.insert(key, value);
            }
            Mutation::Delete { key } => {
                self.data.remove(&key);
            }
        }
    }

    pub(crate) fn begin(&mut self) -> StorageResult<()> {
        if self.staged.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.staged = Some(BTreeMap::new());
        Ok(())
    }

    /// Takes the staged mutations, leaving no transaction behind.
    pub(crate) fn take_staged(&mut self) -> StorageResult<Vec<Mutation>> {
        let staged = self.staged.take().ok_or(StorageError::NoTransaction)?;
        Ok(staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => Mutation::Put { key, value },
                None => Mutation::Delete { key },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Mutation {
        Mutation::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn staged_reads_shadow_committed_data() {
        let mut state = KvState::default();
        state.apply(put("a", "1"));
        state.begin().unwrap();
        assert!(state.write(put("a", "2")).is_none());
        assert_eq!(state.get(b"a"), Some(b"2".to_vec()));

        state.write(Mutation::Delete {
            key: b"a".to_vec(),
        });
        assert_eq!(state.get(b"a"), None);
        assert!(state.entries_with_prefix(b"").is_empty());
    }

    #[test]
    fn prefix_scan_merges_overlay() {
        let mut state = KvState::default();
        state.apply(put("p###1", "x"));
        state.apply(put("q###1", "y"));
        state.begin().unwrap();
        state.write(put("p###2", "z"));

        let keys: Vec<_> = state
            .entries_with_prefix(b"p###")
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"p###1".to_vec(), b"p###2".to_vec()]);
    }

    #[test]
    fn nested_begin_fails() {
        let mut state = KvState::default();
        state.begin().unwrap();
        assert!(matches!(state.begin(), Err(StorageError::TransactionActive)));
        state.take_staged().unwrap();
        assert!(matches!(state.take_staged(), Err(StorageError::NoTransaction)));
    }
}
