//! The cloud service: account switches, cleaning and subscriptions.

use crate::config::RetryPolicy;
use crate::context::CloudContext;
use crate::error::{CloudError, CloudResult};
use crate::event::CloudEvent;
use crate::server::BundleDatabases;
use crate::sync_info::SyncInfo;
use crate::sync_manager::SyncManager;
use ddms_core::metadata::{CloudInfo, SchemaMeta, StoreMetaData, Subscription, EXPIRE_INTERVAL_MS};
use ddms_core::store::CleanMode;
use ddms_core::{anonymous, EventGuard, ExecutorPool, GeneralError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Device id under which the network itself comes online.
pub const NET_UUID: &str = "netUuid";

/// Account event reported to [`CloudService::on_user_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountChange {
    /// Another user came to the foreground.
    Switched,
    /// The user was removed.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Subscribe,
    CloudInfoUpdate,
    SchemaUpdate,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Cloud settings of the device's users.
///
/// Background work (refreshing the account state from the server,
/// downloading schemas, renewing subscriptions) runs on the bound executor
/// and is retried every [`RetryPolicy::retry_interval`] until it succeeds
/// or [`RetryPolicy::max_times`] runs out.
pub struct CloudService {
    this: Weak<CloudService>,
    context: Arc<CloudContext>,
    sync: SyncManager,
    policy: RetryPolicy,
    executor: RwLock<Option<Arc<ExecutorPool>>>,
    _events: EventGuard<CloudEvent>,
}

impl CloudService {
    /// Creates the service and its sync manager.
    pub fn new(context: Arc<CloudContext>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<CloudService>| {
            let weak = this.clone();
            let events = context.events.subscribe(move |event: &CloudEvent| {
                if let CloudEvent::GetSchema(store) = event {
                    if let Some(service) = weak.upgrade() {
                        debug!(
                            bundle = %store.bundle_name,
                            store = %anonymous::change(&store.store_name),
                            instance = store.instance_id,
                            "schema requested"
                        );
                        service.get_schema_meta(store.user, &store.bundle_name, store.instance_id);
                    }
                }
            });
            Self {
                this: this.clone(),
                sync: SyncManager::new(Arc::clone(&context), policy.clone()),
                context,
                policy,
                executor: RwLock::new(None),
                _events: events,
            }
        })
    }

    /// The sync manager driven by this service.
    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Collaborators and the event topic the service runs on.
    pub fn context(&self) -> &Arc<CloudContext> {
        &self.context
    }

    /// Attaches the executor. A second bind is rejected.
    pub fn on_bind(&self, executor: Arc<ExecutorPool>) -> CloudResult<()> {
        let mut slot = self.executor.write();
        if slot.is_some() {
            return Err(CloudError::Store(GeneralError::InvalidArgs));
        }
        self.sync.bind(Arc::clone(&executor));
        *slot = Some(executor);
        Ok(())
    }

    /// Refreshes account state and schemas of every foreground user.
    pub fn on_initialize(&self) {
        self.execute(self.cloud_tasks(0, &[Work::CloudInfoUpdate, Work::SchemaUpdate]));
    }

    /// Turns cloud sync on and applies the given bundle switches.
    ///
    /// Bundles the account does not know are skipped.
    pub fn enable_cloud(
        &self,
        user: i32,
        id: &str,
        switches: &BTreeMap<String, bool>,
    ) -> CloudResult<()> {
        let mut cloud = self.checked_cloud_info(user, id)?;
        cloud.enable_cloud = true;
        for (bundle, on) in switches {
            match cloud.apps.get_mut(bundle) {
                Some(app) => app.cloud_switch = *on,
                None => debug!(user, bundle = %bundle, "switch for unknown bundle ignored"),
            }
        }
        self.context.meta.save_meta(&cloud.key(), &cloud, true)?;
        info!(user, "cloud enabled");
        self.execute(self.cloud_tasks(user, &[]));
        self.start_sync(SyncInfo::new(user));
        Ok(())
    }

    /// Turns cloud sync off and stops running syncs.
    pub fn disable_cloud(&self, user: i32, id: &str) -> CloudResult<()> {
        let mut cloud = self.checked_cloud_info(user, id)?;
        cloud.enable_cloud = false;
        self.context.meta.save_meta(&cloud.key(), &cloud, true)?;
        info!(user, "cloud disabled");
        self.execute(self.cloud_tasks(user, &[]));
        self.sync.stop_cloud_sync(user)?;
        Ok(())
    }

    /// Sets the cloud switch of one bundle.
    pub fn change_app_switch(&self, user: i32, id: &str, bundle: &str, on: bool) -> CloudResult<()> {
        let mut cloud = self.checked_cloud_info(user, id)?;
        let Some(app) = cloud.apps.get_mut(bundle) else {
            error!(user, bundle = %bundle, "unknown bundle");
            return Err(CloudError::invalid_argument(format!("unknown bundle {bundle}")));
        };
        app.cloud_switch = on;
        self.context.meta.save_meta(&cloud.key(), &cloud, true)?;
        self.execute(self.cloud_tasks(user, &[]));
        if cloud.enable_cloud && on {
            self.start_sync(SyncInfo::new(user).with_bundle(bundle));
        }
        Ok(())
    }

    /// Cleans cloud data of the given bundles.
    pub fn clean(
        &self,
        user: i32,
        id: &str,
        actions: &BTreeMap<String, CleanMode>,
    ) -> CloudResult<()> {
        let cloud = self.stored_cloud_info(user)?;
        if cloud.id != id {
            warn!(
                user,
                stored = %anonymous::change(&cloud.id),
                given = %anonymous::change(id),
                "clean with a different account id"
            );
        }
        self.do_clean(&cloud, actions)
    }

    /// Stops syncs of the account, then runs `actions` on every store of
    /// each bundle.
    ///
    /// A store whose clean fails is skipped; a bundle without a schema
    /// aborts the clean.
    pub fn do_clean(&self, cloud: &CloudInfo, actions: &BTreeMap<String, CleanMode>) -> CloudResult<()> {
        self.sync.stop_cloud_sync(cloud.user)?;
        let keys = cloud.schema_keys();
        let local = self.context.registry.get_local_device().uuid;
        for (bundle, action) in actions {
            let (Some(app), Some(key)) = (cloud.apps.get(bundle), keys.get(bundle)) else {
                continue;
            };
            let Some(schema) = self.context.meta.load_meta::<SchemaMeta>(key, true) else {
                error!(bundle = %bundle, "no schema meta");
                return Err(CloudError::SchemaMissing(bundle.clone()));
            };
            for database in &schema.databases {
                let mut lookup = StoreMetaData::new(
                    local.clone(),
                    cloud.user.to_string(),
                    schema.bundle_name.clone(),
                    database.name.clone(),
                );
                lookup.instance_id = app.instance_id;
                let Some(meta) = self.context.meta.load_meta::<StoreMetaData>(&lookup.key(), false) else {
                    error!(bundle = %bundle, store = %lookup.store_alias(), "no store meta");
                    continue;
                };
                let store = self.sync.get_store(&meta, cloud.user, false).map_err(|err| {
                    error!(store = %meta.store_alias(), error = %err, "store unavailable for clean");
                    err
                })?;
                if let Err(err) = store.clean(&[], *action, "") {
                    warn!(
                        user = cloud.user,
                        bundle = %bundle,
                        store = %meta.store_alias(),
                        error = %err,
                        "clean failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// An application changed data that should reach the cloud.
    pub fn notify_data_change(&self, user: i32, id: &str, bundle: &str) -> CloudResult<()> {
        let cloud = self.stored_cloud_info(user)?;
        if cloud.id != id {
            error!(
                given = %anonymous::change(id),
                stored = %anonymous::change(&cloud.id),
                "account id mismatch"
            );
            return Err(CloudError::invalid_argument("account id mismatch"));
        }
        if !cloud.enable_cloud {
            return Err(CloudError::CloudDisabled);
        }
        let Some(app) = cloud.apps.get(bundle) else {
            error!(user, bundle = %bundle, "unknown bundle");
            return Err(CloudError::invalid_argument(format!("unknown bundle {bundle}")));
        };
        if !app.cloud_switch {
            return Err(CloudError::SwitchOff(bundle.to_string()));
        }
        match self.sync.do_cloud_sync(SyncInfo::new(user).with_bundle(bundle)) {
            Ok(()) | Err(GeneralError::SyncTaskMerged) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Forgets the schema and subscription relation of a removed app.
    pub fn on_app_uninstall(&self, bundle: &str, user: i32, instance_id: i32) -> CloudResult<()> {
        let meta = &self.context.meta;
        meta.del_meta(&Subscription::new(user, "").relation_key(bundle), true)?;
        meta.del_meta(&CloudInfo::new(user).schema_key(bundle, instance_id), true)?;
        info!(user, bundle = %bundle, instance_id, "app cloud data forgotten");
        Ok(())
    }

    /// Reacts to account changes.
    pub fn on_user_change(&self, change: AccountChange, user: i32) -> CloudResult<()> {
        if change == AccountChange::Switched {
            self.execute(self.cloud_tasks(user, &[Work::CloudInfoUpdate, Work::SchemaUpdate]));
        }
        self.sync.stop_cloud_sync(user)?;
        Ok(())
    }

    /// A device came online; the network device starts a sync.
    pub fn on_network_online(&self, device: &str) -> CloudResult<()> {
        if device != NET_UUID {
            debug!(device = %anonymous::change(device), "not the network");
            return Ok(());
        }
        if let Some(user) = self.context.account.foreground_users().first() {
            self.start_sync(SyncInfo::new(*user));
        }
        Ok(())
    }

    /// A device went offline; the network device stops syncs.
    pub fn on_network_offline(&self, device: &str) -> CloudResult<()> {
        if device != NET_UUID {
            debug!(device = %anonymous::change(device), "not the network");
            return Ok(());
        }
        if let Some(user) = self.context.account.foreground_users().first() {
            self.sync.stop_cloud_sync(*user)?;
        }
        Ok(())
    }

    /// Account state of `user`, from metadata or else from the server.
    ///
    /// A valid answer from the server is saved. Returns an empty record
    /// if neither knows the user.
    pub fn get_cloud_info(&self, user: i32) -> CloudInfo {
        let key = CloudInfo::new(user).key();
        if let Some(cloud) = self.context.meta.load_meta::<CloudInfo>(&key, true) {
            return cloud;
        }
        let Some(server) = &self.context.server else {
            return CloudInfo::new(user);
        };
        let cloud = server.get_server_info(user);
        if !cloud.is_valid() {
            error!(user, "no cloud info");
            return cloud;
        }
        if let Err(err) = self.context.meta.save_meta(&cloud.key(), &cloud, true) {
            warn!(user, error = %err, "failed to save cloud info");
        }
        cloud
    }

    /// Cloud schema of `bundle`, from metadata or else from the server.
    ///
    /// Returns an empty schema if the account or bundle is unknown.
    pub fn get_schema_meta(&self, user: i32, bundle: &str, instance_id: i32) -> SchemaMeta {
        let cloud = self.get_cloud_info(user);
        if !cloud.is_valid() {
            return SchemaMeta::default();
        }
        let known = cloud
            .apps
            .get(bundle)
            .is_some_and(|app| app.instance_id == instance_id);
        if !bundle.is_empty() && !known {
            debug!(bundle = %bundle, instance_id, "bundle not in cloud info");
            return SchemaMeta::default();
        }
        let key = cloud.schema_key(bundle, instance_id);
        if let Some(schema) = self.context.meta.load_meta::<SchemaMeta>(&key, true) {
            return schema;
        }
        let Some(server) = &self.context.server else {
            return SchemaMeta::default();
        };
        let schema = server.get_app_schema(user, bundle);
        if !schema.is_valid() {
            error!(user, bundle = %bundle, "schema download failed");
            return schema;
        }
        if let Err(err) = self.context.meta.save_meta(&key, &schema, true) {
            warn!(bundle = %bundle, error = %err, "failed to save schema");
        }
        schema
    }

    /// Refreshes the stored account state of `user` from the server.
    ///
    /// A changed account id cleans the cloud metadata of the old account;
    /// bundles newly switched on start syncing.
    pub fn update_cloud_info(&self, user: i32) -> bool {
        let cloud = match self.server_cloud_info(user) {
            Ok(cloud) => cloud,
            Err(err) => {
                error!(user, error = %err, "cloud info update failed");
                return false;
            }
        };
        let meta = &self.context.meta;
        let Some(old) = meta.load_meta::<CloudInfo>(&cloud.key(), true) else {
            return meta.save_meta(&cloud.key(), &cloud, true).is_ok();
        };
        if old.id != cloud.id {
            warn!(
                user,
                server = %anonymous::change(&cloud.id),
                stored = %anonymous::change(&old.id),
                "account changed"
            );
            let actions: BTreeMap<String, CleanMode> = cloud
                .apps
                .keys()
                .map(|bundle| (bundle.clone(), CleanMode::CloudInfo))
                .collect();
            if let Err(err) = self.do_clean(&old, &actions) {
                warn!(user, error = %err, "cleaning the old account failed");
            }
        }
        if cloud.enable_cloud {
            for (bundle, app) in &cloud.apps {
                let was_on = old.is_on(bundle);
                if app.cloud_switch && !was_on {
                    self.start_sync(SyncInfo::new(user).with_bundle(bundle.clone()));
                }
            }
        }
        meta.save_meta(&cloud.key(), &cloud, true).is_ok()
    }

    /// Downloads the schema of every bundle of `user` that has none stored.
    pub fn update_schema(&self, user: i32) -> bool {
        let cloud = match self.server_cloud_info(user) {
            Ok(cloud) => cloud,
            Err(err) => {
                error!(user, error = %err, "schema update failed");
                return false;
            }
        };
        let Some(server) = &self.context.server else {
            return false;
        };
        let meta = &self.context.meta;
        for (bundle, key) in cloud.schema_keys() {
            if meta.load_meta::<SchemaMeta>(&key, true).is_some() {
                continue;
            }
            let schema = server.get_app_schema(user, &bundle);
            if !schema.is_valid() {
                warn!(user, bundle = %bundle, "server has no schema");
                return false;
            }
            if meta.save_meta(&key, &schema, true).is_err() {
                return false;
            }
        }
        true
    }

    /// Brings the change subscriptions of `user` in line with the switches.
    ///
    /// Enabled bundles whose subscription expires within
    /// [`EXPIRE_INTERVAL_MS`] are renewed; disabled bundles with a live
    /// subscription are unsubscribed. Returns false if the account state is
    /// missing or the server refused.
    pub fn do_subscribe(&self, user: i32) -> bool {
        let meta = &self.context.meta;
        let mut sub = meta
            .load_meta::<Subscription>(&Subscription::new(user, "").key(), true)
            .unwrap_or_else(|| Subscription::new(user, ""));
        let Some(server) = &self.context.server else {
            info!("no cloud server, nothing to subscribe");
            return true;
        };
        let Some(cloud) = meta.load_meta::<CloudInfo>(&CloudInfo::new(user).key(), true) else {
            warn!(user, "no cloud info to subscribe with");
            return false;
        };

        let now = now_ms();
        let renew_before = now + EXPIRE_INTERVAL_MS;
        let mut sub_dbs = BundleDatabases::new();
        let mut unsub_dbs = BundleDatabases::new();
        for (bundle, app) in &cloud.apps {
            let enabled = cloud.enable_cloud && app.cloud_switch;
            let expires = sub.expires_time.get(bundle).copied();
            if enabled && expires.is_some_and(|e| e >= renew_before) {
                continue;
            }
            if !enabled && expires.map_or(true, |e| e <= now) {
                continue;
            }
            let key = cloud.schema_key(bundle, app.instance_id);
            if let Some(schema) = meta.load_meta::<SchemaMeta>(&key, true) {
                let target = if enabled { &mut sub_dbs } else { &mut unsub_dbs };
                target.insert(bundle.clone(), schema.databases);
            }
        }
        info!(
            user,
            enabled = cloud.enable_cloud,
            subscribe = sub_dbs.len(),
            unsubscribe = unsub_dbs.len(),
            "subscription update"
        );
        if sub_dbs.is_empty() && unsub_dbs.is_empty() {
            return true;
        }

        let mut ok = true;
        match server.subscribe(user, &sub_dbs) {
            Ok(expires) => sub.expires_time.extend(expires),
            Err(err) => {
                warn!(user, error = %err, "subscribe failed");
                ok = false;
            }
        }
        match server.unsubscribe(user, &unsub_dbs) {
            Ok(()) => {
                for bundle in unsub_dbs.keys() {
                    sub.expires_time.remove(bundle);
                }
            }
            Err(err) => {
                warn!(user, error = %err, "unsubscribe failed");
                ok = false;
            }
        }
        sub.id = cloud.id.clone();
        if let Err(err) = meta.save_meta(&sub.key(), &sub, true) {
            warn!(user, error = %err, "failed to save subscription");
            return false;
        }
        ok
    }

    fn stored_cloud_info(&self, user: i32) -> CloudResult<CloudInfo> {
        self.context
            .meta
            .load_meta::<CloudInfo>(&CloudInfo::new(user).key(), true)
            .ok_or_else(|| {
                error!(user, "no cloud info meta");
                CloudError::NoCloudInfo(user)
            })
    }

    fn server_cloud_info(&self, user: i32) -> CloudResult<CloudInfo> {
        let server = self.context.server.as_ref().ok_or(CloudError::ServerUnavailable)?;
        let cloud = server.get_server_info(user);
        if !cloud.is_valid() {
            error!(user, "server has no cloud info");
            return Err(CloudError::NoCloudInfo(user));
        }
        Ok(cloud)
    }

    fn checked_cloud_info(&self, user: i32, id: &str) -> CloudResult<CloudInfo> {
        let cloud = match self.stored_cloud_info(user) {
            Ok(cloud) => cloud,
            Err(_) => self.server_cloud_info(user)?,
        };
        if cloud.id != id {
            error!(
                given = %anonymous::change(id),
                stored = %anonymous::change(&cloud.id),
                "account id mismatch"
            );
            return Err(CloudError::invalid_argument("account id mismatch"));
        }
        Ok(cloud)
    }

    fn start_sync(&self, info: SyncInfo) {
        let (user, bundle) = (info.user, info.bundle_name.clone());
        match self.sync.do_cloud_sync(info) {
            Ok(()) | Err(GeneralError::SyncTaskMerged) => {}
            Err(err) => warn!(user, bundle = %bundle, error = %err, "cloud sync not started"),
        }
    }

    fn executor(&self) -> Option<Arc<ExecutorPool>> {
        self.executor.read().clone()
    }

    fn execute(&self, tasks: Vec<Box<dyn FnOnce() + Send>>) {
        let Some(executor) = self.executor() else {
            return;
        };
        for task in tasks {
            executor.execute(task);
        }
    }

    /// The given works followed by a subscription refresh.
    fn cloud_tasks(&self, user: i32, works: &[Work]) -> Vec<Box<dyn FnOnce() + Send>> {
        works
            .iter()
            .copied()
            .chain(std::iter::once(Work::Subscribe))
            .map(|work| Box::new(self.work_task(0, user, work)) as Box<dyn FnOnce() + Send>)
            .collect()
    }

    /// Runs `work` for `user`, or every foreground user if 0, rescheduling
    /// it until every user succeeded.
    fn work_task(&self, retry: u32, user: i32, work: Work) -> impl FnOnce() + Send + 'static {
        let weak = self.this.clone();
        move || {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let Some(executor) = service.executor() else {
                return;
            };
            if retry >= service.policy.max_times {
                warn!(user, ?work, retry, "cloud work abandoned");
                return;
            }
            let users = if user == 0 {
                service.context.account.foreground_users()
            } else {
                vec![user]
            };
            let mut finished = true;
            for user in users {
                let done = match work {
                    Work::Subscribe => service.do_subscribe(user),
                    Work::CloudInfoUpdate => service.update_cloud_info(user),
                    Work::SchemaUpdate => service.update_schema(user),
                };
                finished &= done;
            }
            if !finished {
                debug!(user, ?work, retry, "cloud work rescheduled");
                executor.schedule(
                    service.policy.retry_interval,
                    service.work_task(retry + 1, user, work),
                );
            }
        }
    }
}

impl std::fmt::Debug for CloudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudService")
            .field("bound", &self.executor.read().is_some())
            .field("sync", &self.sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MockCloudServer;
    use ddms_core::account::StaticAccount;
    use ddms_core::metadata::{AppInfo, Database, MetaPlane};
    use ddms_core::{AutoCache, CacheConfig, ExecutorConfig, MetaConfig, MetaDataManager};
    use ddms_device::{DeviceRegistry, MockDeviceTransport, RegistryConfig};
    use ddms_storage::{KvDelegate, MemoryKvDelegate, StorageResult};

    const USER: i32 = 100;
    const BUNDLE: &str = "com.example.notes";
    const ACCOUNT: &str = "account-hash";

    fn service() -> (Arc<CloudService>, Arc<MockCloudServer>) {
        let transport = Arc::new(MockDeviceTransport::new());
        transport.set_local("net-local", "uuid-local", "udid-local");
        let registry = DeviceRegistry::new(transport, RegistryConfig::default());
        registry.init_device_info(false);
        let synced = Arc::new(MemoryKvDelegate::new());
        let local = Arc::new(MemoryKvDelegate::new());
        let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
            Ok(match plane {
                MetaPlane::Synced => Arc::clone(&synced) as Arc<dyn KvDelegate>,
                MetaPlane::Local => Arc::clone(&local) as Arc<dyn KvDelegate>,
            })
        };
        let server = Arc::new(MockCloudServer::new());
        let context = CloudContext::new(
            Arc::new(MetaDataManager::new(Arc::new(opener), MetaConfig::default())),
            Arc::new(AutoCache::new(CacheConfig::default())),
            registry,
            Arc::new(StaticAccount::new(vec![USER], ACCOUNT)),
        )
        .with_server(Arc::clone(&server) as _);
        (CloudService::new(Arc::new(context), RetryPolicy::default()), server)
    }

    fn cloud_info(enable_cloud: bool, switch: bool) -> CloudInfo {
        let mut info = CloudInfo::new(USER);
        info.id = ACCOUNT.into();
        info.enable_cloud = enable_cloud;
        info.apps.insert(
            BUNDLE.into(),
            AppInfo {
                bundle_name: BUNDLE.into(),
                cloud_switch: switch,
                ..AppInfo::default()
            },
        );
        info
    }

    fn schema() -> SchemaMeta {
        SchemaMeta {
            version: 1,
            bundle_name: BUNDLE.into(),
            databases: vec![Database {
                name: "notes".into(),
                ..Database::default()
            }],
        }
    }

    fn stored(service: &CloudService) -> CloudInfo {
        service
            .context
            .meta
            .load_meta(&CloudInfo::new(USER).key(), true)
            .unwrap()
    }

    #[test]
    fn bind_only_once() {
        let (service, _) = service();
        let pool = Arc::new(ExecutorPool::new(&ExecutorConfig::new(1, 2)).unwrap());
        service.on_bind(Arc::clone(&pool)).unwrap();
        assert!(service.sync_manager().is_bound());
        assert!(matches!(
            service.on_bind(pool),
            Err(CloudError::Store(GeneralError::InvalidArgs))
        ));
    }

    #[test]
    fn enable_cloud_falls_back_to_server_and_checks_id() {
        let (service, server) = service();
        assert!(matches!(
            service.enable_cloud(USER, ACCOUNT, &BTreeMap::new()),
            Err(CloudError::NoCloudInfo(USER))
        ));

        server.set_info(cloud_info(false, false));
        assert!(matches!(
            service.enable_cloud(USER, "someone-else", &BTreeMap::new()),
            Err(CloudError::InvalidArgument(_))
        ));

        let mut switches = BTreeMap::new();
        switches.insert(BUNDLE.to_string(), true);
        switches.insert("com.example.unknown".to_string(), true);
        service.enable_cloud(USER, ACCOUNT, &switches).unwrap();
        let saved = stored(&service);
        assert!(saved.enable_cloud);
        assert!(saved.is_on(BUNDLE));
        assert!(!saved.exists("com.example.unknown"));
    }

    #[test]
    fn disable_and_switch() {
        let (service, _) = service();
        let info = cloud_info(true, true);
        service.context.meta.save_meta(&info.key(), &info, true).unwrap();

        service.change_app_switch(USER, ACCOUNT, BUNDLE, false).unwrap();
        assert!(!stored(&service).is_on(BUNDLE));
        assert!(matches!(
            service.change_app_switch(USER, ACCOUNT, "com.example.unknown", true),
            Err(CloudError::InvalidArgument(_))
        ));

        // Stopping syncs needs the executor.
        assert!(matches!(
            service.disable_cloud(USER, ACCOUNT),
            Err(CloudError::Store(GeneralError::NotInit))
        ));
        assert!(!stored(&service).enable_cloud);
    }

    #[test]
    fn notify_data_change_checks_account_state() {
        let (service, _) = service();
        assert!(matches!(
            service.notify_data_change(USER, ACCOUNT, BUNDLE),
            Err(CloudError::NoCloudInfo(USER))
        ));

        let info = cloud_info(false, true);
        service.context.meta.save_meta(&info.key(), &info, true).unwrap();
        assert!(matches!(
            service.notify_data_change(USER, "other", BUNDLE),
            Err(CloudError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.notify_data_change(USER, ACCOUNT, BUNDLE),
            Err(CloudError::CloudDisabled)
        ));

        let info = cloud_info(true, false);
        service.context.meta.save_meta(&info.key(), &info, true).unwrap();
        assert!(matches!(
            service.notify_data_change(USER, ACCOUNT, "com.example.unknown"),
            Err(CloudError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.notify_data_change(USER, ACCOUNT, BUNDLE),
            Err(CloudError::SwitchOff(_))
        ));
    }

    #[test]
    fn schema_is_fetched_once_and_cached() {
        let (service, server) = service();
        server.set_info(cloud_info(true, true));
        server.set_schema(schema());

        let fetched = service.get_schema_meta(USER, BUNDLE, 0);
        assert_eq!(fetched, schema());
        let again = service.get_schema_meta(USER, BUNDLE, 0);
        assert_eq!(again, fetched);
        assert_eq!(server.schema_queries(), 1);
        assert!(!service.get_schema_meta(USER, BUNDLE, 3).is_valid());
    }

    #[test]
    fn get_schema_event_stores_the_schema() {
        let (service, server) = service();
        server.set_info(cloud_info(true, true));
        server.set_schema(schema());
        service.context.events.post(&CloudEvent::GetSchema(ddms_core::store::StoreInfo {
            user: USER,
            bundle_name: BUNDLE.into(),
            ..Default::default()
        }));
        let key = CloudInfo::new(USER).schema_key(BUNDLE, 0);
        assert_eq!(service.context.meta.load_meta::<SchemaMeta>(&key, true), Some(schema()));
    }

    #[test]
    fn update_cloud_info_saves_first_answer() {
        let (service, server) = service();
        assert!(!service.update_cloud_info(USER));
        server.set_info(cloud_info(true, false));
        assert!(service.update_cloud_info(USER));
        assert_eq!(stored(&service), cloud_info(true, false));
    }

    #[test]
    fn update_schema_downloads_missing_only() {
        let (service, server) = service();
        server.set_info(cloud_info(true, true));
        assert!(!service.update_schema(USER));
        server.set_schema(schema());
        assert!(service.update_schema(USER));
        assert!(service.update_schema(USER));
        assert_eq!(server.schema_queries(), 2);
    }

    #[test]
    fn subscriptions_follow_switches() {
        let (service, server) = service();
        assert!(!service.do_subscribe(USER));

        let info = cloud_info(true, true);
        let meta = &service.context.meta;
        meta.save_meta(&info.key(), &info, true).unwrap();
        meta.save_meta(&info.schema_key(BUNDLE, 0), &schema(), true).unwrap();
        server.set_now_ms(now_ms());
        assert!(service.do_subscribe(USER));
        assert_eq!(server.subscribed(), vec![(USER, vec![BUNDLE.to_string()])]);
        let sub: Subscription = meta.load_meta(&Subscription::new(USER, "").key(), true).unwrap();
        assert!(!sub.is_expired(BUNDLE, now_ms()));
        assert_eq!(sub.id, ACCOUNT);

        // Fresh subscription: nothing to renew.
        assert!(service.do_subscribe(USER));
        assert_eq!(server.subscribed().len(), 1);

        let info = cloud_info(false, true);
        meta.save_meta(&info.key(), &info, true).unwrap();
        assert!(service.do_subscribe(USER));
        assert_eq!(server.unsubscribed(), vec![(USER, vec![BUNDLE.to_string()])]);
        let sub: Subscription = meta.load_meta(&Subscription::new(USER, "").key(), true).unwrap();
        assert!(sub.expires_time.is_empty());
    }

    #[test]
    fn uninstall_forgets_schema() {
        let (service, _) = service();
        let key = CloudInfo::new(USER).schema_key(BUNDLE, 0);
        service.context.meta.save_meta(&key, &schema(), true).unwrap();
        service.on_app_uninstall(BUNDLE, USER, 0).unwrap();
        assert!(service.context.meta.load_meta::<SchemaMeta>(&key, true).is_none());
    }

    #[test]
    fn network_events_ignore_other_devices() {
        let (service, _) = service();
        service.on_network_online("uuid-a").unwrap();
        service.on_network_offline("uuid-a").unwrap();
        assert!(matches!(
            service.on_network_offline(NET_UUID),
            Err(CloudError::Store(GeneralError::NotInit))
        ));
    }
}
