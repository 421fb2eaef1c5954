//! Journaled file delegate for persistent metadata.

use crate::delegate::{KvDelegate, KvEntry};
use crate::error::{StorageError, StorageResult};
use crate::transaction::{KvState, Mutation};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name used by [`FileKvDelegate::open`] inside the data directory.
pub const JOURNAL_FILE_NAME: &str = "meta.journal";

/// Journals with fewer frames than this are never compacted.
const COMPACT_MIN_FRAMES: u64 = 1024;

/// Size of the little-endian length prefix in front of every frame.
const FRAME_HEADER: usize = 4;

/// A persistent key-value delegate backed by an append-only journal.
///
/// Every committed write (a single put/delete, or a whole transaction) is
/// appended as one frame: a `u32` little-endian length followed by the CBOR
/// encoding of the mutations. On open the journal is replayed into memory.
///
/// # Durability
///
/// - A frame is synced to disk before the write becomes visible
/// - A torn frame at the tail (crash mid-append) is dropped on replay
/// - A complete frame that fails to decode is reported as corruption
///
/// # Locking
///
/// The journal is locked exclusively with `fs2`; a second process opening
/// the same directory fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use ddms_storage::{FileKvDelegate, KvDelegate};
/// use std::path::Path;
///
/// let delegate = FileKvDelegate::open(Path::new("/data/ddms")).unwrap();
/// delegate.put(b"KvStoreMetaData###dev###100", b"{}").unwrap();
/// ```
#[derive(Debug)]
pub struct FileKvDelegate {
    path: PathBuf,
    file: Mutex<File>,
    state: RwLock<KvState>,
    frames: Mutex<u64>,
}

impl FileKvDelegate {
    /// Opens or creates the journal inside `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or journal cannot be created, the
    /// journal is locked by another process, or replay finds corruption.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Self::open_file(&dir.join(JOURNAL_FILE_NAME))
    }

    /// Opens or creates the journal at an explicit path.
    ///
    /// # Errors
    ///
    /// Same as [`FileKvDelegate::open`].
    pub fn open_file(path: &Path) -> StorageResult<Self> {
        let mut file = Self::open_locked(path)?;
        let (state, frames, valid_len) = replay(&mut file)?;
        let len = file.metadata()?.len();
        if valid_len < len {
            warn!(
                path = %path.display(),
                dropped = len - valid_len,
                "dropping torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), keys = state.len(), frames, "journal replayed");

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            state: RwLock::new(state),
            frames: Mutex::new(frames),
        })
    }

    /// Returns the path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of frames currently in the journal.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        *self.frames.lock()
    }

    /// Rewrites the journal so it holds exactly one frame with the live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement journal cannot be written.
    pub fn compact(&self) -> StorageResult<()> {
        let state = self.state.read();
        state.ensure_open()?;
        if state.in_transaction() {
            return Err(StorageError::TransactionActive);
        }
        let live: Vec<Mutation> = state
            .entries_with_prefix(&[])
            .into_iter()
            .map(|entry| Mutation::Put {
                key: entry.key,
                value: entry.value,
            })
            .collect();

        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            if !live.is_empty() {
                tmp.write_all(&encode_frame(&live)?)?;
            }
            tmp.sync_all()?;
        }

        let mut file = self.file.lock();
        fs::rename(&tmp_path, &self.path)?;
        *file = Self::open_locked(&self.path)?;
        *self.frames.lock() = u64::from(!live.is_empty());
        debug!(path = %self.path.display(), keys = live.len(), "journal compacted");
        Ok(())
    }

    fn open_locked(path: &Path) -> StorageResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(path.to_path_buf()))?;
        Ok(file)
    }

    fn append(&self, mutations: &[Mutation]) -> StorageResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(mutations)?;
        let mut file = self.file.lock();
        file.write_all(&frame)?;
        file.sync_data()?;
        *self.frames.lock() += 1;
        Ok(())
    }

    fn maybe_compact(&self) {
        let frames = self.frame_count();
        let live = self.state.read().len() as u64;
        if frames >= COMPACT_MIN_FRAMES && frames > live.saturating_mul(2) {
            if let Err(e) = self.compact() {
                warn!(error = %e, "journal compaction failed");
            }
        }
    }

    fn write(&self, mutation: Mutation) -> StorageResult<()> {
        {
            let mut state = self.state.write();
            state.ensure_open()?;
            let Some(mutation) = state.write(mutation) else {
                return Ok(());
            };
            self.append(std::slice::from_ref(&mutation))?;
            state.apply(mutation);
        }
        self.maybe_compact();
        Ok(())
    }
}

impl KvDelegate for FileKvDelegate {
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
        {
            let state = self.state.read();
            state.ensure_open()?;
            if !state.in_transaction() && state.get(key).is_none() {
                return Ok(());
            }
        }
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
        {
            let mut state = self.state.write();
            state.ensure_open()?;
            let staged = state.take_staged()?;
            self.append(&staged)?;
            for mutation in staged {
                state.apply(mutation);
            }
        }
        self.maybe_compact();
        Ok(())
    }

    fn rollback(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.take_staged().map(|_| ())
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.is_closed() {
            return Ok(());
        }
        state.close();
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.read().is_closed()
    }
}

fn encode_frame(mutations: &[Mutation]) -> StorageResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(mutations, &mut body)
        .map_err(|e| StorageError::Encoding(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| StorageError::Encoding(format!("frame of {} bytes", body.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Replays the journal. Returns the state, the frame count and the length
/// of the valid prefix of the file.
fn replay(file: &mut File) -> StorageResult<(KvState, u64, u64)> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut state = KvState::default();
    let mut frames = 0u64;
    let mut offset = 0usize;
    while offset + FRAME_HEADER <= bytes.len() {
        let mut header = [0u8; FRAME_HEADER];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER]);
        let len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER;
        let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
            break;
        };
        let mutations: Vec<Mutation> = ciborium::de::from_reader(&bytes[start..end]).map_err(
            |e| StorageError::Corrupted {
                offset: offset as u64,
                message: e.to_string(),
            },
        )?;
        for mutation in mutations {
            state.apply(mutation);
        }
        frames += 1;
        offset = end;
    }
    Ok((state, frames, offset as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_open_creates_journal() {
        let dir = tempdir().unwrap();
        let delegate = FileKvDelegate::open(&dir.path().join("meta")).unwrap();
        assert!(delegate.path().exists());
        assert_eq!(delegate.frame_count(), 0);
    }

    #[test]
    fn file_data_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let delegate = FileKvDelegate::open(dir.path()).unwrap();
            delegate.put(b"a", b"1").unwrap();
            delegate.put(b"b", b"2").unwrap();
            delegate.delete(b"a").unwrap();
        }
        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        assert_eq!(delegate.get(b"a").unwrap(), None);
        assert_eq!(delegate.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(delegate.frame_count(), 3);
    }

    #[test]
    fn file_transaction_is_one_frame() {
        let dir = tempdir().unwrap();
        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        delegate.start_transaction().unwrap();
        delegate.put(b"x", b"1").unwrap();
        delegate.put(b"y", b"2").unwrap();
        delegate.commit().unwrap();
        assert_eq!(delegate.frame_count(), 1);

        delegate.start_transaction().unwrap();
        delegate.put(b"z", b"3").unwrap();
        delegate.rollback().unwrap();
        assert_eq!(delegate.get(b"z").unwrap(), None);
        assert_eq!(delegate.frame_count(), 1);
    }

    #[test]
    fn file_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        {
            let delegate = FileKvDelegate::open(dir.path()).unwrap();
            delegate.put(b"a", b"1").unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        assert_eq!(delegate.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileKvDelegate::open(dir.path()).unwrap();
        let second = FileKvDelegate::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_compact_keeps_live_entries() {
        let dir = tempdir().unwrap();
        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        for i in 0..10u8 {
            delegate.put(b"counter", &[i]).unwrap();
        }
        delegate.put(b"other", b"o").unwrap();
        delegate.compact().unwrap();
        assert_eq!(delegate.frame_count(), 1);
        drop(delegate);

        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        assert_eq!(delegate.get(b"counter").unwrap(), Some(vec![9]));
        assert_eq!(delegate.get(b"other").unwrap(), Some(b"o".to_vec()));
    }

    #[test]
    fn file_delete_missing_key_writes_nothing() {
        let dir = tempdir().unwrap();
        let delegate = FileKvDelegate::open(dir.path()).unwrap();
        delegate.delete(b"missing").unwrap();
        assert_eq!(delegate.frame_count(), 0);
    }
}
