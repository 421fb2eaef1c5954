use super::cloud_db::{BindInfo, CloudConfig};
use super::progress::DetailAsync;
use super::sync_mode;
use super::watcher::{Origin, Watcher};
use crate::error::{GeneralError, StoreResult};
use crate::metadata::Database;
use crate::value::{VBuckets, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// What [`GeneralStore::clean`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanMode {
    /// Data received from nearby devices.
    NearbyData,
    /// Cloud data and the cloud sync metadata.
    CloudData,
    /// Cloud sync metadata only; local copies stay.
    CloudInfo,
    /// Data written locally.
    LocalData,
    /// The cloud water version.
    CleanWater,
}

impl TryFrom<i32> for CleanMode {
    type Error = GeneralError;

    fn try_from(mode: i32) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(CleanMode::NearbyData),
            1 => Ok(CleanMode::CloudData),
            2 => Ok(CleanMode::CloudInfo),
            3 => Ok(CleanMode::LocalData),
            4 => Ok(CleanMode::CleanWater),
            _ => Err(GeneralError::InvalidArgs),
        }
    }
}

/// Kind of a distributed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Synced with nearby devices.
    Device,
    /// Synced with the cloud.
    Cloud,
}

/// Selection of the data a sync covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenQuery {
    /// Tables to sync; empty for all.
    pub tables: Vec<String>,
    /// Only keys starting with this prefix.
    pub key_prefix: Vec<u8>,
    /// Only these keys.
    pub in_keys: Vec<Vec<u8>>,
    valid: bool,
}

impl Default for GenQuery {
    fn default() -> Self {
        Self::all()
    }
}

impl GenQuery {
    /// Everything.
    pub fn all() -> Self {
        Self {
            tables: Vec::new(),
            key_prefix: Vec::new(),
            in_keys: Vec::new(),
            valid: true,
        }
    }

    /// The given tables.
    pub fn tables(tables: Vec<String>) -> Self {
        Self {
            tables,
            ..Self::all()
        }
    }

    /// Keys starting with `prefix`.
    pub fn key_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            key_prefix: prefix.into(),
            ..Self::all()
        }
    }

    /// A query the engine cannot run.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            ..Self::all()
        }
    }

    /// Returns true if the engine can run this query.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns true if the query covers everything.
    pub fn is_full(&self) -> bool {
        self.tables.is_empty() && self.key_prefix.is_empty() && self.in_keys.is_empty()
    }
}

/// Parameters of one sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncParam {
    /// Packed mode, see [`sync_mode`].
    pub mode: i32,
    /// How long a blocking caller waits; zero for fully async.
    pub wait: Duration,
    /// True for catch-up syncs issued after a failure.
    pub is_compensation: bool,
    /// What triggered the sync.
    pub trigger_mode: i32,
    /// Cloud user; 0 selects the current foreground user.
    pub user: i32,
    /// Correlation id for logs.
    pub trace_id: String,
}

impl SyncParam {
    /// Creates parameters for `mode`.
    pub fn new(mode: i32) -> Self {
        Self {
            mode,
            wait: Duration::ZERO,
            is_compensation: false,
            trigger_mode: 0,
            user: 0,
            trace_id: String::new(),
        }
    }

    /// Sets the cloud user.
    #[must_use]
    pub fn with_user(mut self, user: i32) -> Self {
        self.user = user;
        self
    }

    /// Sets the blocking wait.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Direction part of the mode.
    pub fn sync_mode(&self) -> i32 {
        sync_mode::sync_mode(self.mode)
    }

    /// Trigger part of the mode.
    pub fn high_mode(&self) -> i32 {
        sync_mode::high_mode(self.mode)
    }
}

/// Identity of a store instance in events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreInfo {
    /// Access token of the owning application.
    pub token_id: u32,
    /// Owning bundle.
    pub bundle_name: String,
    /// Store name.
    pub store_name: String,
    /// Application clone index.
    pub instance_id: i32,
    /// Owning user.
    pub user: i32,
}

/// One capability contract over every backing engine.
///
/// Every operation fails with [`GeneralError::AlreadyClosed`] once the
/// store was closed.
pub trait GeneralStore: Send + Sync {
    /// Attaches cloud connectors. A second call succeeds without effect.
    fn bind(
        &self,
        database: &Database,
        bind_infos: BTreeMap<i32, BindInfo>,
        config: &CloudConfig,
    ) -> StoreResult<()>;

    /// Returns true once [`GeneralStore::bind`] succeeded.
    fn is_bound(&self) -> bool;

    /// Starts a nearby or cloud sync; progress arrives through `callback`.
    fn sync(
        &self,
        devices: &[String],
        query: &GenQuery,
        callback: Option<DetailAsync>,
        param: &SyncParam,
    ) -> StoreResult<()>;

    /// Removes synced data or sync metadata.
    fn clean(&self, devices: &[String], mode: CleanMode, table: &str) -> StoreResult<()>;

    /// Registers a change watcher for `origin`.
    fn watch(&self, origin: Origin, watcher: Arc<dyn Watcher>) -> StoreResult<()>;

    /// Removes a watcher registered with [`GeneralStore::watch`].
    fn unwatch(&self, origin: Origin, watcher: &Arc<dyn Watcher>) -> StoreResult<()>;

    /// Runs a read query against `table`.
    fn query(&self, table: &str, sql: &str, args: &[Value]) -> StoreResult<VBuckets>;

    /// Marks tables as distributed.
    fn set_distributed_tables(&self, tables: &[String], kind: TableKind) -> StoreResult<()>;

    /// Publishes sync identifiers for account and anonymous peers.
    fn set_equal_identifier(&self, app_id: &str, store_id: &str) -> StoreResult<()>;

    /// Cloud water versions seen for `device`; empty once closed.
    fn get_water_version(&self, device: &str) -> Vec<String>;

    /// Closes the store; fails with [`GeneralError::Busy`] while syncs run.
    fn close(&self) -> StoreResult<()>;

    /// Takes a reference; returns 0 if the store is already dead.
    fn add_ref(&self) -> i32;

    /// Drops a reference; the store tears down at zero.
    fn release(&self) -> i32;

    /// Current reference count, the cache's own reference included.
    fn ref_count(&self) -> i32;
}
