use crate::error::StoreResult;
use crate::value::VBucket;
use std::sync::Arc;
use std::time::Duration;

/// Connection to one cloud database.
pub trait CloudDb: Send + Sync {
    /// Takes the cloud lock; returns its lease.
    fn lock(&self) -> StoreResult<Duration>;

    /// Extends the lease of the cloud lock.
    fn heartbeat(&self) -> StoreResult<()>;

    /// Releases the cloud lock.
    fn unlock(&self) -> StoreResult<()>;

    /// Closes the connection.
    fn close(&self) -> StoreResult<()>;
}

/// Downloads assets referenced by synced rows.
pub trait AssetLoader: Send + Sync {
    /// Fills the assets of `row` in `table`.
    fn download(&self, table: &str, gid: &str, row: &mut VBucket) -> StoreResult<()>;
}

/// Cloud connectors bound to a store for one user.
#[derive(Clone, Default)]
pub struct BindInfo {
    /// Database connector.
    pub db: Option<Arc<dyn CloudDb>>,
    /// Asset connector.
    pub loader: Option<Arc<dyn AssetLoader>>,
}

impl std::fmt::Debug for BindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindInfo")
            .field("db", &self.db.is_some())
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

/// Limits applied to cloud sync batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudConfig {
    /// Maximum records per batch.
    pub max_number: i32,
    /// Maximum bytes per batch.
    pub max_size: i32,
    /// Conflict retries before giving up on a record.
    pub max_retry_conflict_times: i32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            max_number: 30,
            max_size: 1024 * 512,
            max_retry_conflict_times: 20,
        }
    }
}

impl CloudConfig {
    /// Sets the batch limits.
    #[must_use]
    pub fn with_limits(mut self, max_number: i32, max_size: i32) -> Self {
        self.max_number = max_number;
        self.max_size = max_size;
        self
    }
}
