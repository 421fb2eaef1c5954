//! Durable two-plane metadata manager.

use crate::error::{MetaError, MetaResult};
use ddms_storage::{KvDelegate, StorageResult};
use parking_lot::{ReentrantMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::StoreMetaData;

/// Which copy of the metadata a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaPlane {
    /// Replicated to trusted peers.
    Synced,
    /// Never leaves the device.
    Local,
}

impl MetaPlane {
    /// Maps the `is_local` flag used by the manager API.
    pub fn from_local(is_local: bool) -> Self {
        if is_local {
            MetaPlane::Local
        } else {
            MetaPlane::Synced
        }
    }
}

/// Kind of a synced-plane mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFlag {
    /// The key did not exist before.
    Insert,
    /// The key existed and was overwritten.
    Update,
    /// The key was removed.
    Delete,
}

/// Handle returned by [`MetaDataManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Callback receiving `(key, value, flag)` for synced-plane changes.
///
/// The value is empty for deletions.
pub type MetaObserver = Arc<dyn Fn(&[u8], &[u8], ChangeFlag) + Send + Sync>;

/// Hook asked to propagate synced-plane changes to peers.
pub type Syncer = Arc<dyn Fn(&[String]) + Send + Sync>;

/// One entry pulled from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    /// Metadata key.
    pub key: String,
    /// New value, or `None` if the peer deleted the key.
    pub value: Option<Vec<u8>>,
}

/// Opens the delegate backing a plane.
pub trait DelegateOpener: Send + Sync {
    /// Opens (or re-opens) the delegate for `plane`.
    fn open(&self, plane: MetaPlane) -> StorageResult<Arc<dyn KvDelegate>>;
}

impl<F> DelegateOpener for F
where
    F: Fn(MetaPlane) -> StorageResult<Arc<dyn KvDelegate>> + Send + Sync,
{
    fn open(&self, plane: MetaPlane) -> StorageResult<Arc<dyn KvDelegate>> {
        self(plane)
    }
}

/// Metadata manager configuration.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Attempts to open a delegate before giving up.
    pub max_retry_times: u32,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            max_retry_times: 100,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl MetaConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of open attempts.
    #[must_use]
    pub fn with_max_retry_times(mut self, times: u32) -> Self {
        self.max_retry_times = times;
        self
    }

    /// Sets the pause between open attempts.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[derive(Clone)]
struct Planes {
    synced: Arc<dyn KvDelegate>,
    local: Arc<dyn KvDelegate>,
}

impl Planes {
    fn get(&self, plane: MetaPlane) -> &Arc<dyn KvDelegate> {
        match plane {
            MetaPlane::Synced => &self.synced,
            MetaPlane::Local => &self.local,
        }
    }
}

/// Shared ground truth for store, cloud and device metadata.
///
/// All access is serialized by a reentrant lock, so an observer invoked
/// from a save may load or save again on the same thread.
pub struct MetaDataManager {
    config: MetaConfig,
    opener: Arc<dyn DelegateOpener>,
    lock: ReentrantMutex<()>,
    planes: RwLock<Option<Planes>>,
    observers: RwLock<BTreeMap<ObserverId, (Vec<u8>, MetaObserver)>>,
    next_observer: AtomicU64,
    syncer: RwLock<Option<Syncer>>,
}

impl MetaDataManager {
    /// Creates a manager; delegates are opened on first use.
    pub fn new(opener: Arc<dyn DelegateOpener>, config: MetaConfig) -> Self {
        Self {
            config,
            opener,
            lock: ReentrantMutex::new(()),
            planes: RwLock::new(None),
            observers: RwLock::new(BTreeMap::new()),
            next_observer: AtomicU64::new(1),
            syncer: RwLock::new(None),
        }
    }

    /// Serializes `value` and writes it under `key`.
    pub fn save_meta<T: Serialize>(&self, key: &str, value: &T, is_local: bool) -> MetaResult<()> {
        let bytes = encode(key, value)?;
        let plane = MetaPlane::from_local(is_local);
        let _guard = self.lock.lock();
        let delegate = self.delegate(plane)?;
        let existed = plane == MetaPlane::Synced && delegate.get(key.as_bytes())?.is_some();
        delegate.put(key.as_bytes(), &bytes)?;
        if plane == MetaPlane::Synced {
            let flag = if existed {
                ChangeFlag::Update
            } else {
                ChangeFlag::Insert
            };
            self.notify(key.as_bytes(), &bytes, flag);
            self.request_sync(&[key.to_string()]);
        }
        Ok(())
    }

    /// Writes several records of one type in a single transaction.
    pub fn save_metas<T: Serialize>(&self, entries: &[(String, T)], is_local: bool) -> MetaResult<()> {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode(key, value)?)))
            .collect::<MetaResult<Vec<_>>>()?;
        let plane = MetaPlane::from_local(is_local);
        let _guard = self.lock.lock();
        let delegate = self.delegate(plane)?;
        let mut flags = Vec::with_capacity(encoded.len());
        delegate.start_transaction()?;
        let staged = encoded.iter().try_for_each(|(key, bytes)| {
            let existed = delegate.get(key.as_bytes())?.is_some();
            flags.push(if existed {
                ChangeFlag::Update
            } else {
                ChangeFlag::Insert
            });
            delegate.put(key.as_bytes(), bytes)
        });
        finish_transaction(delegate.as_ref(), staged)?;
        if plane == MetaPlane::Synced {
            for ((key, bytes), flag) in encoded.iter().zip(flags) {
                self.notify(key.as_bytes(), bytes, flag);
            }
            let keys: Vec<String> = encoded.into_iter().map(|(k, _)| k).collect();
            self.request_sync(&keys);
        }
        Ok(())
    }

    /// Loads the record under `key`.
    ///
    /// Returns `None` if the key is absent, unreadable, or the store could
    /// not be opened; callers fall back to defaults.
    pub fn load_meta<T: DeserializeOwned>(&self, key: &str, is_local: bool) -> Option<T> {
        match self.try_load_meta(key, is_local) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "failed to load metadata");
                None
            }
        }
    }

    /// Loads the record under `key`, surfacing engine and decode errors.
    pub fn try_load_meta<T: DeserializeOwned>(&self, key: &str, is_local: bool) -> MetaResult<Option<T>> {
        let _guard = self.lock.lock();
        let delegate = self.delegate(MetaPlane::from_local(is_local))?;
        match delegate.get(key.as_bytes())? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Loads every record whose key starts with `prefix`.
    ///
    /// Returns `None` on engine failure; undecodable records are skipped.
    pub fn load_meta_list<T: DeserializeOwned>(&self, prefix: &str, is_local: bool) -> Option<Vec<T>> {
        let _guard = self.lock.lock();
        let entries = self
            .delegate(MetaPlane::from_local(is_local))
            .and_then(|d| d.entries_with_prefix(prefix.as_bytes()).map_err(MetaError::from));
        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                warn!(prefix, error = %err, "failed to scan metadata");
                return None;
            }
        };
        let values = entries
            .into_iter()
            .filter_map(|entry| {
                let key = String::from_utf8_lossy(&entry.key).into_owned();
                match decode(&key, &entry.value) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(error = %err, "skipping undecodable metadata");
                        None
                    }
                }
            })
            .collect();
        Some(values)
    }

    /// Keys under `prefix`.
    pub fn load_keys(&self, prefix: &str, is_local: bool) -> MetaResult<Vec<String>> {
        let _guard = self.lock.lock();
        let keys = self
            .delegate(MetaPlane::from_local(is_local))?
            .keys_with_prefix(prefix.as_bytes())?;
        Ok(keys
            .into_iter()
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    /// Deletes `key`. Deleting a missing key succeeds.
    pub fn del_meta(&self, key: &str, is_local: bool) -> MetaResult<()> {
        let plane = MetaPlane::from_local(is_local);
        let _guard = self.lock.lock();
        let delegate = self.delegate(plane)?;
        let existed = delegate.get(key.as_bytes())?.is_some();
        delegate.delete(key.as_bytes())?;
        if plane == MetaPlane::Synced && existed {
            self.notify(key.as_bytes(), &[], ChangeFlag::Delete);
            self.request_sync(&[key.to_string()]);
        }
        Ok(())
    }

    /// Deletes several keys in a single transaction.
    pub fn del_metas(&self, keys: &[String], is_local: bool) -> MetaResult<()> {
        let plane = MetaPlane::from_local(is_local);
        let _guard = self.lock.lock();
        let delegate = self.delegate(plane)?;
        let removed = delete_in_transaction(delegate.as_ref(), keys.iter().map(String::as_str))?;
        if plane == MetaPlane::Synced {
            self.announce_deleted(&removed);
        }
        Ok(())
    }

    /// Removes every record tied to `meta` from both planes.
    ///
    /// Either both planes lose the records or neither does: the local plane
    /// is cleared first and restored if the synced plane refuses the delete.
    pub fn delete_store_meta(&self, meta: &StoreMetaData) -> MetaResult<()> {
        let related = meta.related_keys();
        let _guard = self.lock.lock();
        let synced = self.delegate(MetaPlane::Synced)?;
        let local = self.delegate(MetaPlane::Local)?;
        let local_keys: Vec<&str> = related.iter().filter(|(_, l)| *l).map(|(k, _)| k.as_str()).collect();
        let synced_keys: Vec<&str> = related.iter().filter(|(_, l)| !l).map(|(k, _)| k.as_str()).collect();

        let saved = load_entries(local.as_ref(), &local_keys)?;
        delete_in_transaction(local.as_ref(), saved.iter().map(|(k, _)| k.as_str()))?;
        let removed = match delete_in_transaction(synced.as_ref(), synced_keys.into_iter()) {
            Ok(removed) => removed,
            Err(err) => {
                if let Err(restore) = put_in_transaction(local.as_ref(), &saved) {
                    error!(
                        store = %meta.store_alias(),
                        error = %restore,
                        "failed to restore local store metadata"
                    );
                }
                return Err(err);
            }
        };
        debug!(store = %meta.store_alias(), bundle = %meta.bundle_name, "deleted store metadata");
        self.announce_deleted(&removed);
        Ok(())
    }

    /// Applies entries pulled from a peer to the synced plane.
    ///
    /// Observers are notified; the syncer is not, since the change came
    /// from the network.
    pub fn apply_remote(&self, changes: &[RemoteChange]) -> MetaResult<()> {
        let _guard = self.lock.lock();
        let delegate = self.delegate(MetaPlane::Synced)?;
        let mut flags = Vec::with_capacity(changes.len());
        delegate.start_transaction()?;
        let staged = changes.iter().try_for_each(|change| {
            let existed = delegate.get(change.key.as_bytes())?.is_some();
            match &change.value {
                Some(value) => {
                    flags.push(Some(if existed {
                        ChangeFlag::Update
                    } else {
                        ChangeFlag::Insert
                    }));
                    delegate.put(change.key.as_bytes(), value)
                }
                None => {
                    flags.push(existed.then_some(ChangeFlag::Delete));
                    delegate.delete(change.key.as_bytes())
                }
            }
        });
        finish_transaction(delegate.as_ref(), staged)?;
        for (change, flag) in changes.iter().zip(flags) {
            if let Some(flag) = flag {
                let value = change.value.as_deref().unwrap_or_default();
                self.notify(change.key.as_bytes(), value, flag);
            }
        }
        Ok(())
    }

    /// Registers `observer` for synced-plane keys starting with `prefix`.
    pub fn subscribe(&self, prefix: impl Into<Vec<u8>>, observer: MetaObserver) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().insert(id, (prefix.into(), observer));
        id
    }

    /// Removes an observer. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.write().remove(&id).is_some()
    }

    /// Installs the hook that propagates synced-plane changes to peers.
    pub fn set_syncer(&self, syncer: Syncer) {
        *self.syncer.write() = Some(syncer);
    }

    /// Closes the delegates; the next call re-opens them.
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        if let Some(planes) = self.planes.write().take() {
            for delegate in [planes.synced, planes.local] {
                if let Err(err) = delegate.close() {
                    warn!(error = %err, "failed to close metadata delegate");
                }
            }
        }
    }

    fn delegate(&self, plane: MetaPlane) -> MetaResult<Arc<dyn KvDelegate>> {
        if let Some(planes) = self.planes.read().as_ref() {
            let delegate = planes.get(plane);
            if !delegate.is_closed() {
                return Ok(Arc::clone(delegate));
            }
        }
        let attempts = self.config.max_retry_times.max(1);
        for attempt in 1..=attempts {
            match self.open_planes() {
                Ok(planes) => {
                    let delegate = Arc::clone(planes.get(plane));
                    *self.planes.write() = Some(planes);
                    if attempt > 1 {
                        debug!(attempt, "metadata delegate ready");
                    }
                    return Ok(delegate);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "metadata delegate unavailable");
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_interval);
                    }
                }
            }
        }
        Err(MetaError::NotReady { attempts })
    }

    fn open_planes(&self) -> StorageResult<Planes> {
        Ok(Planes {
            synced: self.opener.open(MetaPlane::Synced)?,
            local: self.opener.open(MetaPlane::Local)?,
        })
    }

    fn notify(&self, key: &[u8], value: &[u8], flag: ChangeFlag) {
        let matching: Vec<MetaObserver> = self
            .observers
            .read()
            .values()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in matching {
            observer(key, value, flag);
        }
    }

    fn announce_deleted(&self, removed: &[String]) {
        for key in removed {
            self.notify(key.as_bytes(), &[], ChangeFlag::Delete);
        }
        if !removed.is_empty() {
            self.request_sync(removed);
        }
    }

    fn request_sync(&self, keys: &[String]) {
        let syncer = self.syncer.read().clone();
        if let Some(syncer) = syncer {
            syncer(keys);
        }
    }
}

impl std::fmt::Debug for MetaDataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaDataManager")
            .field("open", &self.planes.read().is_some())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> MetaResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| MetaError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> MetaResult<T> {
    serde_json::from_slice(bytes).map_err(|e| MetaError::Decode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn finish_transaction(
    delegate: &dyn KvDelegate,
    staged: StorageResult<()>,
) -> MetaResult<()> {
    match staged {
        Ok(()) => delegate.commit().map_err(MetaError::from),
        Err(err) => {
            if let Err(rollback) = delegate.rollback() {
                warn!(error = %rollback, "metadata rollback failed");
            }
            Err(err.into())
        }
    }
}

/// Reads the present entries among `keys`.
fn load_entries(delegate: &dyn KvDelegate, keys: &[&str]) -> MetaResult<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(value) = delegate.get(key.as_bytes())? {
            entries.push((key.to_string(), value));
        }
    }
    Ok(entries)
}

fn put_in_transaction(delegate: &dyn KvDelegate, entries: &[(String, Vec<u8>)]) -> MetaResult<()> {
    delegate.start_transaction()?;
    let staged = entries
        .iter()
        .try_for_each(|(key, value)| delegate.put(key.as_bytes(), value));
    finish_transaction(delegate, staged)
}

/// Deletes `keys` in one transaction; returns the keys that existed.
fn delete_in_transaction<'a>(
    delegate: &dyn KvDelegate,
    keys: impl Iterator<Item = &'a str>,
) -> MetaResult<Vec<String>> {
    let mut removed = Vec::new();
    delegate.start_transaction()?;
    let staged = keys.into_iter().try_for_each(|key| {
        if delegate.get(key.as_bytes())?.is_some() {
            removed.push(key.to_string());
        }
        delegate.delete(key.as_bytes())
    });
    finish_transaction(delegate, staged)?;
    Ok(removed)
}
