//! Contracts of the embedded sync engines.
//!
//! The general stores never talk to a database directly. They drive one of
//! two delegate traits: [`KvSyncDelegate`] for the conflict-resolving KV
//! engine and [`RelationalDelegate`] for the SQL engine with distributed
//! tables. Engines are opened through [`KvEngine`] and [`RelationalEngine`].

use crate::error::{EngineError, EngineResult};
use ddms_core::metadata::Database;
use ddms_core::store::{AssetLoader, CloudDb, GenQuery, Progress, TableKind};
use ddms_core::{VBuckets, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How concurrent writes from different devices are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The newest write wins.
    #[default]
    LastWin,
    /// Writes are reconciled per originating device.
    DeviceCollaboration,
}

/// Security label handling of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityFlag {
    /// Readable while the device is locked.
    #[default]
    Ece,
    /// Readable only after first unlock.
    Sece,
}

/// Security label and flag passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityOption {
    /// One of the metadata security levels; `NO_LABEL` when unset.
    pub label: i32,
    /// File protection flag.
    pub flag: SecurityFlag,
}

/// Options for opening a KV database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvOpenOptions {
    /// Create the database if it does not exist.
    pub create_if_necessary: bool,
    /// The database file is encrypted.
    pub is_encrypted: bool,
    /// Key material for an encrypted database.
    pub password: Vec<u8>,
    /// Compress values during sync.
    pub is_need_compress: bool,
    /// Conflict resolution policy.
    pub conflict_policy: ConflictPolicy,
    /// Identify the store by (app, store) instead of (user, app, store).
    pub sync_dual_tuple_mode: bool,
    /// Compression rate; zero when compression is off.
    pub compression_rate: u8,
    /// Schema text, if any.
    pub schema: String,
    /// Security label.
    pub security: SecurityOption,
}

/// Options for opening a relational database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdbOpenOptions {
    /// The database file is encrypted.
    pub is_encrypted: bool,
    /// Key material for an encrypted database.
    pub password: Vec<u8>,
    /// Identify the store by (app, store) instead of (user, app, store).
    pub sync_dual_tuple_mode: bool,
}

/// Where a database lives and who owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStoreId {
    /// Application id.
    pub app_id: String,
    /// Owning user as passed to the engine.
    pub user: String,
    /// Application clone index.
    pub instance_id: i32,
    /// Store name.
    pub store_id: String,
    /// Directory holding the database files.
    pub data_dir: String,
}

/// What [`KvSyncDelegate::remove_device_data`] clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Data received from the given nearby device.
    Device,
    /// Cloud sync flags only.
    CloudInfo,
    /// Cloud sync flags and cloud-originated data.
    CloudData,
}

/// Limits applied to cloud uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloudSyncConfig {
    /// Records per upload batch.
    pub max_upload_count: i32,
    /// Bytes per upload batch.
    pub max_upload_size: i32,
    /// Conflict retries before an upload fails.
    pub max_retry_conflict_times: i32,
}

/// Parameters of one cloud sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSyncOption {
    /// Devices named by the caller.
    pub devices: Vec<String>,
    /// Engine sync mode.
    pub mode: i32,
    /// Selection of the data to sync.
    pub query: GenQuery,
    /// How long the engine may block the caller.
    pub wait: Duration,
    /// Cloud users to sync.
    pub users: Vec<String>,
    /// Run ahead of queued automatic tasks.
    pub priority_task: bool,
    /// Only catch up on earlier failures.
    pub compensated_only: bool,
}

/// Per-device status of a nearby sync.
pub type DeviceStatuses = BTreeMap<String, EngineResult<()>>;

/// Completion callback of a nearby KV sync.
pub type BriefCallback = Box<dyn FnOnce(&DeviceStatuses) + Send>;

/// Status of one table in a nearby relational sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    /// Table name.
    pub table: String,
    /// Outcome.
    pub status: EngineResult<()>,
}

/// Per-device table statuses of a nearby relational sync.
pub type TableStatuses = BTreeMap<String, Vec<TableStatus>>;

/// Completion callback of a nearby relational sync.
pub type TableBriefCallback = Box<dyn FnOnce(&TableStatuses) + Send>;

/// Counters of one transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferInfo {
    /// Records to transfer.
    pub total: u32,
    /// Records transferred.
    pub success_count: u32,
    /// Records that failed.
    pub fail_count: u32,
    /// Inserted records.
    pub insert_count: u32,
    /// Updated records.
    pub update_count: u32,
    /// Deleted records.
    pub delete_count: u32,
}

impl TransferInfo {
    /// Returns true if the transfer changed local data.
    pub fn changed_data(&self) -> bool {
        self.insert_count > 0 || self.update_count > 0 || self.delete_count > 0
    }
}

/// Progress of one table in a cloud sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableProcess {
    /// Stage of the table.
    pub process: Progress,
    /// Upload counters.
    pub upload: TransferInfo,
    /// Download counters.
    pub download: TransferInfo,
}

/// Progress of a cloud sync for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProcess {
    /// Overall stage.
    pub process: Progress,
    /// Overall status.
    pub status: EngineResult<()>,
    /// Per-table progress.
    pub tables: BTreeMap<String, TableProcess>,
}

impl SyncProcess {
    /// A finished process with the given status and no table detail.
    pub fn finished(status: EngineResult<()>) -> Self {
        Self {
            process: Progress::Finished,
            status,
            tables: BTreeMap::new(),
        }
    }
}

/// Progress callback of a cloud sync; may fire several times.
pub type ProcessCallback = Arc<dyn Fn(&BTreeMap<String, SyncProcess>) + Send + Sync>;

/// Entries handed to an interceptor before they cross the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptedData {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl InterceptedData {
    /// Wraps key/value entries.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { entries }
    }

    /// Keys of every entry, in order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Replaces the key of the entry at `index`.
    pub fn modify_key(&mut self, index: usize, key: Vec<u8>) -> EngineResult<()> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| EngineError::invalid_args(format!("no entry at {index}")))?;
        if key.is_empty() {
            return Err(EngineError::invalid_args("empty key"));
        }
        entry.0 = key;
        Ok(())
    }

    /// Unwraps the entries.
    pub fn into_entries(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
    }
}

/// Rewrites entries in flight; called with `(data, source_id, target_id)`.
pub type Interceptor =
    Arc<dyn Fn(&mut InterceptedData, &str, &str) -> EngineResult<()> + Send + Sync>;

/// Where an engine change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOrigin {
    /// Written locally.
    Local,
    /// Downloaded from the cloud.
    Cloud,
    /// Received from a nearby device.
    Remote,
}

/// Changed primary keys of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineChange {
    /// Table name; empty for KV engines.
    pub table: String,
    /// Inserted rows.
    pub inserted: Vec<Value>,
    /// Updated rows.
    pub updated: Vec<Value>,
    /// Deleted rows.
    pub deleted: Vec<Value>,
}

/// Receives engine data changes.
pub trait EngineObserver: Send + Sync {
    /// Called once per changed table; `original_id` names the source.
    fn on_change(&self, origin: EngineOrigin, original_id: &str, change: &EngineChange);
}

/// The conflict-resolving KV sync engine.
pub trait KvSyncDelegate: Send + Sync {
    /// Nearby sync; `query` is `None` for the whole store.
    fn sync(
        &self,
        devices: &[String],
        mode: i32,
        query: Option<&GenQuery>,
        on_complete: BriefCallback,
        wait: bool,
    ) -> EngineResult<()>;

    /// Subscribes `devices` to changes matching `query`.
    fn subscribe_remote_query(
        &self,
        devices: &[String],
        query: &GenQuery,
        on_complete: BriefCallback,
        wait: bool,
    ) -> EngineResult<()>;

    /// Cancels a remote query subscription.
    fn unsubscribe_remote_query(
        &self,
        devices: &[String],
        query: &GenQuery,
        on_complete: BriefCallback,
        wait: bool,
    ) -> EngineResult<()>;

    /// Cloud sync.
    fn cloud_sync(&self, option: &CloudSyncOption, on_process: ProcessCallback) -> EngineResult<()>;

    /// Removes synced data; an empty `device` means every device.
    fn remove_device_data(&self, device: &str, mode: ClearMode) -> EngineResult<()>;

    /// Lets `devices` reach this store under `identifier`.
    fn set_equal_identifier(&self, identifier: &str, devices: &[String]) -> EngineResult<()>;

    /// Installs cloud connectors keyed by user.
    fn set_cloud_db(&self, dbs: BTreeMap<String, Arc<dyn CloudDb>>) -> EngineResult<()>;

    /// Installs the cloud schema per user.
    fn set_cloud_db_schema(&self, schemas: BTreeMap<String, Database>) -> EngineResult<()>;

    /// Installs cloud upload limits.
    fn set_cloud_sync_config(&self, config: &CloudSyncConfig) -> EngineResult<()>;

    /// Installs the interceptor run on outgoing entries.
    fn set_push_interceptor(&self, interceptor: Interceptor);

    /// Installs the interceptor run on incoming entries.
    fn set_receive_interceptor(&self, interceptor: Interceptor);

    /// Registers the change observer.
    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()>;

    /// Removes the change observer.
    fn unregister_observer(&self) -> EngineResult<()>;

    /// Number of running sync tasks.
    fn task_count(&self) -> usize;

    /// Cloud water versions recorded for `device`.
    fn get_cloud_version(&self, device: &str) -> EngineResult<BTreeMap<String, String>>;

    /// Closes the database.
    fn close(&self) -> EngineResult<()>;
}

/// The relational sync engine.
pub trait RelationalDelegate: Send + Sync {
    /// Nearby sync of `tables`; empty for all distributed tables.
    fn sync(
        &self,
        devices: &[String],
        mode: i32,
        tables: &[String],
        on_complete: TableBriefCallback,
        wait: bool,
    ) -> EngineResult<()>;

    /// Cloud sync.
    fn cloud_sync(&self, option: &CloudSyncOption, on_process: ProcessCallback) -> EngineResult<()>;

    /// Removes synced data; empty `device` means every device and empty
    /// `table` every table.
    fn remove_device_data(&self, device: &str, table: &str, mode: ClearMode) -> EngineResult<()>;

    /// Marks `table` as distributed.
    fn create_distributed_table(&self, table: &str, kind: TableKind) -> EngineResult<()>;

    /// Runs a read query locally.
    fn query(&self, table: &str, sql: &str, args: &[Value]) -> EngineResult<VBuckets>;

    /// Runs a read query on a nearby device.
    fn remote_query(&self, device: &str, sql: &str, args: &[Value]) -> EngineResult<VBuckets>;

    /// Installs the cloud connector.
    fn set_cloud_db(&self, db: Arc<dyn CloudDb>) -> EngineResult<()>;

    /// Installs the asset downloader.
    fn set_asset_loader(&self, loader: Arc<dyn AssetLoader>) -> EngineResult<()>;

    /// Installs the cloud schema.
    fn set_cloud_db_schema(&self, schema: &Database) -> EngineResult<()>;

    /// Registers the change observer.
    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> EngineResult<()>;

    /// Removes the change observer.
    fn unregister_observer(&self) -> EngineResult<()>;

    /// Number of running cloud tasks.
    fn cloud_task_count(&self) -> usize;

    /// Closes the database.
    fn close(&self) -> EngineResult<()>;
}

/// Opens KV databases.
pub trait KvEngine: Send + Sync {
    /// Opens the database named by `id`.
    fn open(&self, id: &EngineStoreId, options: &KvOpenOptions) -> EngineResult<Arc<dyn KvSyncDelegate>>;
}

/// Opens relational databases.
pub trait RelationalEngine: Send + Sync {
    /// Opens the database named by `id`.
    fn open(
        &self,
        id: &EngineStoreId,
        options: &RdbOpenOptions,
    ) -> EngineResult<Arc<dyn RelationalDelegate>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_key_bounds() {
        let mut data = InterceptedData::new(vec![(b"a".to_vec(), b"1".to_vec())]);
        data.modify_key(0, b"b".to_vec()).unwrap();
        assert_eq!(data.keys(), vec![b"b".to_vec()]);
        assert!(data.modify_key(1, b"c".to_vec()).is_err());
        assert!(data.modify_key(0, Vec::new()).is_err());
    }

    #[test]
    fn transfer_change_detection() {
        let mut info = TransferInfo::default();
        assert!(!info.changed_data());
        info.delete_count = 1;
        assert!(info.changed_data());
    }
}
