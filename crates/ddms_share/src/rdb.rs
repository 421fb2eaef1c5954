//! Observers of template subscriptions.

use crate::error::{ShareError, ShareResult};
use crate::observer::{Caller, ObserverHandle, ObserverId, RdbChangeNode, RdbObserver};
use crate::scheduler::{ScheduleTarget, SchedulerManager};
use crate::source::TemplateDataSource;
use crate::template::{SubscriberKey, TemplateManager};
use crate::uri::is_data_proxy_uri;
use ddms_core::anonymous;
use ddms_core::metadata::StoreMetaData;
use ddms_core::ConcurrentMap;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// One observer registered under a [`SubscriberKey`].
#[derive(Debug, Clone)]
pub struct RdbObserverNode {
    /// Callback handle.
    pub observer: ObserverHandle<dyn RdbObserver>,
    /// Who registered it.
    pub caller: Caller,
    /// Disabled observers are skipped on delivery.
    pub enabled: bool,
    /// Set when a change was skipped while disabled.
    pub notify_on_enabled: bool,
}

impl RdbObserverNode {
    fn new(observer: ObserverHandle<dyn RdbObserver>, caller: Caller) -> Self {
        Self {
            observer,
            caller,
            enabled: true,
            notify_on_enabled: false,
        }
    }
}

/// Registry of template subscriptions.
///
/// A notification evaluates the key's template against its store and
/// delivers the non-empty predicate results to every enabled observer.
pub struct RdbSubscriberManager {
    this: Weak<Self>,
    observers: ConcurrentMap<SubscriberKey, Vec<RdbObserverNode>>,
    templates: Arc<TemplateManager>,
    scheduler: Arc<SchedulerManager>,
    source: Arc<dyn TemplateDataSource>,
}

impl RdbSubscriberManager {
    /// Creates the registry and makes it the scheduler's target.
    pub fn new(
        templates: Arc<TemplateManager>,
        scheduler: Arc<SchedulerManager>,
        source: Arc<dyn TemplateDataSource>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            observers: ConcurrentMap::new(),
            templates,
            scheduler,
            source,
        });
        let target: Weak<dyn ScheduleTarget> = Arc::downgrade(&manager) as Weak<RdbSubscriberManager>;
        manager.scheduler.set_target(target);
        manager
    }

    /// Registers `observer` under `key`.
    ///
    /// The new observer is notified once right away. The key's schedule
    /// starts when this is its only enabled observer.
    pub fn add(
        &self,
        key: &SubscriberKey,
        observer: ObserverHandle<dyn RdbObserver>,
        caller: Caller,
        user: i32,
        meta: &StoreMetaData,
    ) -> ShareResult<()> {
        info!(
            uri = %anonymous::change(&key.uri),
            token = caller.token_id,
            "add subscriber"
        );
        let node = RdbObserverNode::new(observer.clone(), caller);
        self.observers.compute(key.clone(), |_, nodes| {
            nodes.push(node.clone());
            true
        });
        self.link_to_death(key, &observer);

        if let Err(err) = self.notify(key, user, std::slice::from_ref(&node), meta) {
            warn!(uri = %anonymous::change(&key.uri), error = %err, "first notification skipped");
        }
        if self.get_enable_observer_count(key) == 1 {
            self.scheduler.execute(key, user, meta);
        }
        self.scheduler.add_to_cache(key, user, meta);
        Ok(())
    }

    /// Removes the observers `token` registered under `key`.
    pub fn delete(&self, key: &SubscriberKey, token_id: u32) -> ShareResult<()> {
        let mut found = false;
        self.observers.compute_if_present(key, |key, nodes| {
            found = true;
            info!(uri = %anonymous::change(&key.uri), token = token_id, "delete subscriber");
            nodes.retain(|node| node.caller.token_id != token_id);
            !nodes.is_empty()
        });
        if !found {
            return Err(ShareError::SubscriberNotExist);
        }
        if !self.observers.contains(key) {
            self.scheduler.remove_timer(key);
            self.scheduler.remove_from_cache(key);
        }
        Ok(())
    }

    /// Removes every observer registered by the process `(token, pid)`.
    pub fn delete_by_process(&self, token_id: u32, pid: u32) {
        let mut emptied = Vec::new();
        self.observers.erase_if(|key, nodes| {
            nodes.retain(|node| node.caller != Caller::new(token_id, pid));
            if nodes.is_empty() {
                emptied.push(key.clone());
            }
            nodes.is_empty()
        });
        for key in emptied {
            info!(
                uri = %anonymous::change(&key.uri),
                subscriber = key.subscriber_id,
                bundle = %key.bundle_name,
                token = token_id,
                "last subscriber gone, timer removed"
            );
            self.scheduler.remove_timer(&key);
            self.scheduler.remove_from_cache(&key);
        }
    }

    /// Stops delivering to the observers `token` registered under `key`.
    pub fn disable(&self, key: &SubscriberKey, token_id: u32) -> ShareResult<()> {
        let found = self.observers.compute_if_present(key, |_, nodes| {
            for node in nodes.iter_mut().filter(|n| n.caller.token_id == token_id) {
                node.enabled = false;
                node.notify_on_enabled = false;
            }
            true
        });
        found.then_some(()).ok_or(ShareError::SubscriberNotExist)
    }

    /// Resumes delivering to the observers `token` registered under `key`.
    ///
    /// An observer that missed a change while disabled is notified at
    /// once. If the key's schedule stopped meanwhile it is restarted.
    pub fn enable(
        &self,
        key: &SubscriberKey,
        token_id: u32,
        user: i32,
        meta: &StoreMetaData,
    ) -> ShareResult<()> {
        let found = self.observers.compute_if_present(key, |key, nodes| {
            for node in nodes.iter_mut().filter(|n| n.caller.token_id == token_id) {
                node.enabled = true;
                let ever_stopped = self.scheduler.ever_stopped(key);
                if !node.notify_on_enabled && !ever_stopped {
                    continue;
                }
                node.notify_on_enabled = false;
                if let Err(err) = self.notify(key, user, std::slice::from_ref(node), meta) {
                    warn!(uri = %anonymous::change(&key.uri), error = %err, "catch-up notification skipped");
                }
                if ever_stopped {
                    self.scheduler.execute(key, user, meta);
                    self.scheduler.set_ever_stopped(key, false);
                }
            }
            true
        });
        found.then_some(()).ok_or(ShareError::SubscriberNotExist)
    }

    /// Notifies every key subscribed to `uri`, then re-arms their schedules.
    pub fn emit(&self, uri: &str, user: i32, meta: &StoreMetaData) {
        if !is_data_proxy_uri(uri) {
            return;
        }
        let keys = self.get_keys_by_uri(uri);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.emit_key(key, user, meta);
        }
        self.scheduler.execute_uri(uri, user, meta);
    }

    /// Notifies the keys of `uri` owned by `subscriber_id`, then re-arms
    /// the schedule of `(uri, subscriber_id, bundle)`.
    pub fn emit_by_subscriber(
        &self,
        uri: &str,
        subscriber_id: i64,
        bundle_name: &str,
        user: i32,
        meta: &StoreMetaData,
    ) {
        if !is_data_proxy_uri(uri) {
            return;
        }
        for key in self
            .get_keys_by_uri(uri)
            .into_iter()
            .filter(|key| key.subscriber_id == subscriber_id)
        {
            self.emit_key(&key, user, meta);
        }
        self.scheduler
            .execute(&SubscriberKey::new(uri, subscriber_id, bundle_name), user, meta);
    }

    /// Notifies the observers of one key.
    pub fn emit_by_key(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData) {
        if is_data_proxy_uri(&key.uri) {
            self.emit_key(key, user, meta);
        }
    }

    /// Keys subscribed to `uri`.
    pub fn get_keys_by_uri(&self, uri: &str) -> Vec<SubscriberKey> {
        self.observers
            .keys()
            .into_iter()
            .filter(|key| key.uri == uri)
            .collect()
    }

    /// Number of enabled observers under `key`.
    pub fn get_enable_observer_count(&self, key: &SubscriberKey) -> usize {
        self.observers
            .get(key)
            .map_or(0, |nodes| nodes.iter().filter(|n| n.enabled).count())
    }

    /// Number of subscribed keys.
    pub fn get_count(&self) -> usize {
        self.observers.len()
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.observers.clear();
    }

    /// Removes the observer whose process died.
    pub fn on_remote_died(&self, key: &SubscriberKey, observer: ObserverId) {
        let present = self.observers.compute_if_present(key, |key, nodes| {
            if let Some(pos) = nodes.iter().position(|n| n.observer.id() == observer) {
                nodes.remove(pos);
                info!(uri = %anonymous::change(&key.uri), "observer died, subscriber removed");
            }
            !nodes.is_empty()
        });
        if !present {
            self.scheduler.remove_timer(key);
            self.scheduler.remove_from_cache(key);
        }
    }

    fn emit_key(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData) {
        self.observers.compute_if_present(key, |key, nodes| {
            if let Err(err) = self.notify(key, user, nodes, meta) {
                warn!(uri = %anonymous::change(&key.uri), error = %err, "notification skipped");
            }
            for node in nodes.iter_mut().filter(|n| !n.enabled) {
                node.notify_on_enabled = true;
            }
            true
        });
    }

    fn link_to_death(&self, key: &SubscriberKey, observer: &ObserverHandle<dyn RdbObserver>) {
        let this = self.this.clone();
        let key = key.clone();
        let linked = observer.link_to_death(move |id| {
            if let Some(manager) = this.upgrade() {
                manager.on_remote_died(&key, id);
            }
        });
        if !linked {
            warn!("observer already dead");
        }
    }

    /// Evaluates the template of `key` and delivers it to `nodes`.
    ///
    /// Returns the number of observers notified.
    fn notify(
        &self,
        key: &SubscriberKey,
        user: i32,
        nodes: &[RdbObserverNode],
        meta: &StoreMetaData,
    ) -> ShareResult<usize> {
        let template = self.templates.get(key, user).inspect_err(|_| {
            error!(
                uri = %anonymous::change(&key.uri),
                subscriber = key.subscriber_id,
                bundle = %key.bundle_name,
                "template undefined"
            );
        })?;
        let mut meta = meta.clone();
        meta.bundle_name = key.bundle_name.clone();
        meta.user = user.to_string();

        let mut change = RdbChangeNode {
            uri: key.uri.clone(),
            subscriber_id: key.subscriber_id,
            bundle_name: key.bundle_name.clone(),
            data: Vec::new(),
        };
        for predicate in &template.predicates {
            match self.source.query(&meta, &key.uri, &predicate.select_sql) {
                Ok(rows) if rows.is_empty() => {}
                Ok(rows) => change.data.push(predicate_payload(&predicate.key, rows)),
                Err(err) => {
                    warn!(uri = %anonymous::change(&key.uri), error = %err, "predicate query failed");
                }
            }
        }
        if !template.update.is_empty() {
            if let Err(err) = self.source.update(&meta, &key.uri, &template.update) {
                error!(
                    uri = %anonymous::change(&key.uri),
                    subscriber = key.subscriber_id,
                    error = %err,
                    "update failed"
                );
            }
        }

        let mut delivered = 0;
        for node in nodes.iter().filter(|n| n.enabled && n.observer.is_alive()) {
            node.observer.callback().on_change_from_rdb(&change);
            delivered += 1;
        }
        info!(
            uri = %anonymous::change(&key.uri),
            observers = nodes.len(),
            data = change.data.len(),
            "emit"
        );
        Ok(delivered)
    }
}

impl ScheduleTarget for RdbSubscriberManager {
    fn is_enabled(&self, key: &SubscriberKey) -> bool {
        self.get_enable_observer_count(key) > 0
    }

    fn on_schedule(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData) {
        self.emit_by_key(key, user, meta);
    }
}

impl std::fmt::Debug for RdbSubscriberManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdbSubscriberManager")
            .field("keys", &self.get_count())
            .finish_non_exhaustive()
    }
}

/// Wraps predicate rows as `{"<key>": <rows>}`.
///
/// Rows that are not valid JSON are delivered as a string.
fn predicate_payload(key: &str, rows: String) -> String {
    let value = serde_json::from_str(&rows).unwrap_or(serde_json::Value::String(rows));
    let mut object = serde_json::Map::new();
    object.insert(key.to_string(), value);
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::scheduler::SchedulerConfig;
    use crate::source::MemoryTemplateDataSource;
    use crate::template::{PredicateTemplateNode, Template};
    use ddms_core::metadata::MetaPlane;
    use ddms_core::{MetaConfig, MetaDataManager};
    use ddms_storage::{KvDelegate, MemoryKvDelegate, StorageResult};

    const USER: i32 = 100;
    const URI: &str = "datashareproxy://com.example.mail/inbox";
    const UNREAD: &str = "select count(*) from mail where seen = 0";

    struct Fixture {
        manager: Arc<RdbSubscriberManager>,
        templates: Arc<TemplateManager>,
        source: Arc<MemoryTemplateDataSource>,
    }

    fn fixture() -> Fixture {
        let synced = Arc::new(MemoryKvDelegate::new());
        let local = Arc::new(MemoryKvDelegate::new());
        let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
            Ok(match plane {
                MetaPlane::Synced => Arc::clone(&synced) as Arc<dyn KvDelegate>,
                MetaPlane::Local => Arc::clone(&local) as Arc<dyn KvDelegate>,
            })
        };
        let meta = Arc::new(MetaDataManager::new(Arc::new(opener), MetaConfig::default()));
        let source = Arc::new(MemoryTemplateDataSource::new());
        let scheduler = SchedulerManager::new(
            Arc::clone(&meta),
            Arc::clone(&source) as _,
            SchedulerConfig::default(),
        );
        let templates = Arc::new(TemplateManager::new(meta, Arc::clone(&scheduler)));
        let manager = RdbSubscriberManager::new(
            Arc::clone(&templates),
            scheduler,
            Arc::clone(&source) as _,
        );
        Fixture {
            manager,
            templates,
            source,
        }
    }

    fn key() -> SubscriberKey {
        SubscriberKey::new(URI, 1, "com.example.mail")
    }

    fn store() -> StoreMetaData {
        StoreMetaData::new("uuid", "100", "com.example.mail", "mail")
    }

    fn observer() -> (Arc<RecordingObserver>, ObserverHandle<dyn RdbObserver>) {
        let recorder = RecordingObserver::new();
        let handle = ObserverHandle::<dyn RdbObserver>::new(Arc::clone(&recorder) as _);
        (recorder, handle)
    }

    fn with_template(f: &Fixture) {
        let template = Template::new(vec![
            PredicateTemplateNode::new("unread", UNREAD),
            PredicateTemplateNode::new("empty", "select nothing"),
        ]);
        f.templates.add(&key(), USER, &template).unwrap();
        f.source.set_result(UNREAD, "[{\"count\":3}]");
    }

    #[test]
    fn payload_wraps_rows_under_the_predicate_key() {
        assert_eq!(predicate_payload("n", "[1,2]".into()), r#"{"n":[1,2]}"#);
        assert_eq!(predicate_payload("n", "oops".into()), r#"{"n":"oops"}"#);
    }

    #[test]
    fn add_notifies_the_new_observer_once() {
        let f = fixture();
        with_template(&f);
        let (recorder, handle) = observer();
        f.manager.add(&key(), handle, Caller::new(1, 10), USER, &store()).unwrap();

        let changes = recorder.rdb_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].data, vec![r#"{"unread":[{"count":3}]}"#]);
        assert_eq!(changes[0].subscriber_id, 1);
        assert_eq!(f.manager.get_enable_observer_count(&key()), 1);
        assert_eq!(f.manager.get_keys_by_uri(URI), vec![key()]);
    }

    #[test]
    fn missing_template_still_registers() {
        let f = fixture();
        let (recorder, handle) = observer();
        f.manager.add(&key(), handle, Caller::new(1, 10), USER, &store()).unwrap();
        assert!(recorder.rdb_changes().is_empty());
        assert_eq!(f.manager.get_count(), 1);
    }

    #[test]
    fn disabled_observers_catch_up_on_enable() {
        let f = fixture();
        with_template(&f);
        let (recorder, handle) = observer();
        f.manager.add(&key(), handle, Caller::new(1, 10), USER, &store()).unwrap();
        recorder.reset();

        f.manager.disable(&key(), 1).unwrap();
        f.manager.emit(URI, USER, &store());
        assert!(recorder.rdb_changes().is_empty());

        f.manager.enable(&key(), 1, USER, &store()).unwrap();
        assert_eq!(recorder.rdb_changes().len(), 1);

        f.manager.disable(&key(), 1).unwrap();
        f.manager.enable(&key(), 1, USER, &store()).unwrap();
        assert_eq!(recorder.rdb_changes().len(), 1);
    }

    #[test]
    fn update_failure_does_not_block_delivery() {
        let f = fixture();
        let template = Template::new(vec![PredicateTemplateNode::new("unread", UNREAD)])
            .with_update("update mail set seen = 1");
        f.templates.add(&key(), USER, &template).unwrap();
        f.source.set_result(UNREAD, "[1]");
        f.source.fail("update mail set seen = 1");

        let (recorder, handle) = observer();
        f.manager.add(&key(), handle, Caller::new(1, 10), USER, &store()).unwrap();
        assert_eq!(recorder.rdb_changes().len(), 1);
        assert_eq!(f.source.updates(), vec!["update mail set seen = 1"]);
    }

    #[test]
    fn emit_ignores_other_schemes_and_uris() {
        let f = fixture();
        with_template(&f);
        let (recorder, handle) = observer();
        f.manager.add(&key(), handle, Caller::new(1, 10), USER, &store()).unwrap();
        recorder.reset();

        f.manager.emit("datashare:///com.example.mail/inbox", USER, &store());
        f.manager.emit("datashareproxy://com.example.mail/outbox", USER, &store());
        assert!(recorder.rdb_changes().is_empty());

        f.manager.emit_by_key(&key(), USER, &store());
        f.manager.emit_by_subscriber(URI, 1, "com.example.mail", USER, &store());
        f.manager.emit_by_subscriber(URI, 2, "com.example.mail", USER, &store());
        assert_eq!(recorder.rdb_changes().len(), 2);
    }

    #[test]
    fn delete_by_token_and_by_process() {
        let f = fixture();
        let (_, first) = observer();
        let (_, second) = observer();
        f.manager.add(&key(), first, Caller::new(1, 10), USER, &store()).unwrap();
        f.manager.add(&key(), second, Caller::new(2, 20), USER, &store()).unwrap();

        f.manager.delete(&key(), 1).unwrap();
        assert_eq!(f.manager.get_enable_observer_count(&key()), 1);

        f.manager.delete_by_process(2, 99);
        assert_eq!(f.manager.get_count(), 1);
        f.manager.delete_by_process(2, 20);
        assert_eq!(f.manager.get_count(), 0);

        assert!(matches!(f.manager.delete(&key(), 2), Err(ShareError::SubscriberNotExist)));
        assert!(matches!(f.manager.disable(&key(), 2), Err(ShareError::SubscriberNotExist)));
        assert!(matches!(
            f.manager.enable(&key(), 2, USER, &store()),
            Err(ShareError::SubscriberNotExist)
        ));
    }

    #[test]
    fn dead_observers_are_pruned() {
        let f = fixture();
        let (_, alive) = observer();
        let (_, doomed) = observer();
        f.manager.add(&key(), alive, Caller::new(1, 10), USER, &store()).unwrap();
        f.manager.add(&key(), doomed.clone(), Caller::new(1, 11), USER, &store()).unwrap();
        assert_eq!(f.manager.get_enable_observer_count(&key()), 2);

        doomed.kill();
        assert_eq!(f.manager.get_enable_observer_count(&key()), 1);
        f.manager.clear();
        assert_eq!(f.manager.get_count(), 0);
    }
}
