//! Cloud server collaborator.

use ddms_core::metadata::{CloudInfo, Database, SchemaMeta};
use ddms_core::store::{AssetLoader, CloudDb};
use ddms_core::{GeneralError, StoreResult, VBucket};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Databases of each bundle, as passed to (un)subscribe.
pub type BundleDatabases = BTreeMap<String, Vec<Database>>;

/// The cloud provider.
pub trait CloudServer: Send + Sync {
    /// Account state of `user` as the server sees it.
    fn get_server_info(&self, user: i32) -> CloudInfo;

    /// Cloud schema of `bundle`.
    fn get_app_schema(&self, user: i32, bundle: &str) -> SchemaMeta;

    /// Subscribes to changes of the given databases.
    ///
    /// Returns the new expiry time, in epoch milliseconds, of every bundle.
    fn subscribe(&self, user: i32, dbs: &BundleDatabases) -> StoreResult<BTreeMap<String, u64>>;

    /// Drops the subscriptions of the given databases.
    fn unsubscribe(&self, user: i32, dbs: &BundleDatabases) -> StoreResult<()>;

    /// Connects the cloud database backing `database`.
    fn connect_cloud_db(&self, token_id: u32, database: &Database) -> Option<Arc<dyn CloudDb>>;

    /// Connects the asset loader of `database`.
    fn connect_asset_loader(
        &self,
        token_id: u32,
        database: &Database,
    ) -> Option<Arc<dyn AssetLoader>>;
}

/// Subscriptions granted by [`MockCloudServer`] last this long.
pub const MOCK_SUBSCRIPTION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Default)]
struct MockCloudDb {
    closed: AtomicBool,
}

impl CloudDb for MockCloudDb {
    fn lock(&self) -> StoreResult<Duration> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GeneralError::AlreadyClosed);
        }
        Ok(Duration::from_secs(60))
    }

    fn heartbeat(&self) -> StoreResult<()> {
        Ok(())
    }

    fn unlock(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct MockAssetLoader;

impl AssetLoader for MockAssetLoader {
    fn download(&self, _table: &str, _gid: &str, _row: &mut VBucket) -> StoreResult<()> {
        Ok(())
    }
}

/// Programmable cloud server for tests.
#[derive(Debug, Default)]
pub struct MockCloudServer {
    infos: RwLock<BTreeMap<i32, CloudInfo>>,
    schemas: RwLock<BTreeMap<String, SchemaMeta>>,
    refuse_connect: AtomicBool,
    subscribe_status: Mutex<Option<GeneralError>>,
    now_ms: Mutex<u64>,
    subscribed: Mutex<Vec<(i32, Vec<String>)>>,
    unsubscribed: Mutex<Vec<(i32, Vec<String>)>>,
    info_queries: AtomicUsize,
    schema_queries: AtomicUsize,
}

impl MockCloudServer {
    /// Creates a server that knows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the account state reported for `info.user`.
    pub fn set_info(&self, info: CloudInfo) {
        self.infos.write().insert(info.user, info);
    }

    /// Sets the schema reported for `schema.bundle_name`.
    pub fn set_schema(&self, schema: SchemaMeta) {
        self.schemas.write().insert(schema.bundle_name.clone(), schema);
    }

    /// Makes connect calls return nothing.
    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Makes subscribe fail with `err`.
    pub fn set_subscribe_status(&self, err: Option<GeneralError>) {
        *self.subscribe_status.lock() = err;
    }

    /// Sets the clock used to compute granted expiry times.
    pub fn set_now_ms(&self, now_ms: u64) {
        *self.now_ms.lock() = now_ms;
    }

    /// Subscribe calls as (user, bundles).
    pub fn subscribed(&self) -> Vec<(i32, Vec<String>)> {
        self.subscribed.lock().clone()
    }

    /// Unsubscribe calls with at least one bundle, as (user, bundles).
    pub fn unsubscribed(&self) -> Vec<(i32, Vec<String>)> {
        self.unsubscribed.lock().clone()
    }

    /// Number of account queries served.
    pub fn info_queries(&self) -> usize {
        self.info_queries.load(Ordering::SeqCst)
    }

    /// Number of schema queries served.
    pub fn schema_queries(&self) -> usize {
        self.schema_queries.load(Ordering::SeqCst)
    }
}

impl CloudServer for MockCloudServer {
    fn get_server_info(&self, user: i32) -> CloudInfo {
        self.info_queries.fetch_add(1, Ordering::SeqCst);
        self.infos
            .read()
            .get(&user)
            .cloned()
            .unwrap_or_else(|| CloudInfo::new(user))
    }

    fn get_app_schema(&self, _user: i32, bundle: &str) -> SchemaMeta {
        self.schema_queries.fetch_add(1, Ordering::SeqCst);
        self.schemas.read().get(bundle).cloned().unwrap_or_default()
    }

    fn subscribe(&self, user: i32, dbs: &BundleDatabases) -> StoreResult<BTreeMap<String, u64>> {
        if let Some(err) = *self.subscribe_status.lock() {
            return Err(err);
        }
        if dbs.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.subscribed.lock().push((user, dbs.keys().cloned().collect()));
        let expires = *self.now_ms.lock() + MOCK_SUBSCRIPTION_TTL.as_millis() as u64;
        Ok(dbs.keys().map(|bundle| (bundle.clone(), expires)).collect())
    }

    fn unsubscribe(&self, user: i32, dbs: &BundleDatabases) -> StoreResult<()> {
        if !dbs.is_empty() {
            self.unsubscribed.lock().push((user, dbs.keys().cloned().collect()));
        }
        Ok(())
    }

    fn connect_cloud_db(&self, _token_id: u32, _database: &Database) -> Option<Arc<dyn CloudDb>> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MockCloudDb::default()))
    }

    fn connect_asset_loader(
        &self,
        _token_id: u32,
        _database: &Database,
    ) -> Option<Arc<dyn AssetLoader>> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MockAssetLoader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_gets_empty_info() {
        let server = MockCloudServer::new();
        let info = server.get_server_info(100);
        assert_eq!(info.user, 100);
        assert!(!info.is_valid());
        assert_eq!(server.info_queries(), 1);
    }

    #[test]
    fn subscribe_grants_expiry() {
        let server = MockCloudServer::new();
        server.set_now_ms(1_000);
        let mut dbs = BundleDatabases::new();
        dbs.insert("b".into(), vec![Database::default()]);
        let expires = server.subscribe(100, &dbs).unwrap();
        assert_eq!(expires["b"], 1_000 + MOCK_SUBSCRIPTION_TTL.as_millis() as u64);
        assert_eq!(server.subscribed(), vec![(100, vec!["b".to_string()])]);

        server.set_subscribe_status(Some(GeneralError::NetworkError));
        assert_eq!(server.subscribe(100, &dbs), Err(GeneralError::NetworkError));
    }

    #[test]
    fn connect_can_be_refused() {
        let server = MockCloudServer::new();
        assert!(server.connect_cloud_db(1, &Database::default()).is_some());
        server.refuse_connect(true);
        assert!(server.connect_cloud_db(1, &Database::default()).is_none());
        assert!(server.connect_asset_loader(1, &Database::default()).is_none());
    }
}
