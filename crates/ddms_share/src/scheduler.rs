//! Timers re-evaluating templates on the schedule their store asks for.
//!
//! A template may carry a scheduler statement. Running it yields the next
//! time, in epoch seconds, the template should be evaluated again. The
//! [`SchedulerManager`] keeps one timer per subscription key. When a timer
//! fires it asks the [`ScheduleTarget`] to notify the key's observers, then
//! runs the statement again to arm the next timer. If every observer of the
//! key is disabled at fire time the schedule stops and the key is flagged
//! as having stopped, so re-enabling an observer can restart it.

use crate::source::TemplateDataSource;
use crate::template::{load_template, SubscriberKey};
use ddms_core::anonymous;
use ddms_core::metadata::StoreMetaData;
use ddms_core::{ExecutorPool, MetaDataManager, TaskId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Shortest delay before a timer fires.
    pub min_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Sets the shortest delay before a timer fires.
    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }
}

/// Receives timer firings.
pub trait ScheduleTarget: Send + Sync {
    /// Returns true if any observer of `key` is enabled.
    fn is_enabled(&self, key: &SubscriberKey) -> bool;

    /// Notifies the observers of `key`.
    fn on_schedule(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData);
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    generation: u64,
    task: TaskId,
}

/// Per-key timers driven by template scheduler statements.
pub struct SchedulerManager {
    this: Weak<Self>,
    meta: Arc<MetaDataManager>,
    source: Arc<dyn TemplateDataSource>,
    config: SchedulerConfig,
    executor: RwLock<Option<Arc<ExecutorPool>>>,
    target: RwLock<Option<Weak<dyn ScheduleTarget>>>,
    timers: Mutex<BTreeMap<SubscriberKey, Timer>>,
    generation: Mutex<u64>,
    ever_stopped: Mutex<BTreeSet<SubscriberKey>>,
    cache: Mutex<BTreeMap<SubscriberKey, (i32, StoreMetaData)>>,
}

impl SchedulerManager {
    /// Creates a scheduler reading templates from `meta`.
    pub fn new(
        meta: Arc<MetaDataManager>,
        source: Arc<dyn TemplateDataSource>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            meta,
            source,
            config,
            executor: RwLock::new(None),
            target: RwLock::new(None),
            timers: Mutex::new(BTreeMap::new()),
            generation: Mutex::new(0),
            ever_stopped: Mutex::new(BTreeSet::new()),
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    /// Sets the pool timers run on.
    pub fn bind(&self, executor: Arc<ExecutorPool>) {
        *self.executor.write() = Some(executor);
    }

    /// Sets who is notified when a timer fires.
    pub fn set_target(&self, target: Weak<dyn ScheduleTarget>) {
        *self.target.write() = Some(target);
    }

    /// Runs the scheduler statement of `key` and arms its timer.
    ///
    /// Does nothing if the key has no template or the template has no
    /// scheduler statement. A statement answering no time stops the
    /// schedule.
    pub fn execute(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData) {
        let template = match load_template(&self.meta, key, user) {
            Ok(template) => template,
            Err(err) => {
                debug!(uri = %anonymous::change(&key.uri), error = %err, "no template to schedule");
                return;
            }
        };
        if template.scheduler.is_empty() {
            return;
        }
        let mut meta = meta.clone();
        meta.bundle_name = key.bundle_name.clone();
        meta.user = user.to_string();
        match self.source.remind_time(&meta, &key.uri, &template.scheduler) {
            Ok(Some(at)) => self.set_timer(key, user, meta, at),
            Ok(None) => {
                debug!(uri = %anonymous::change(&key.uri), "schedule ended");
                self.remove_timer(key);
            }
            Err(err) => {
                warn!(uri = %anonymous::change(&key.uri), error = %err, "scheduler statement failed");
            }
        }
    }

    /// Runs [`execute`](Self::execute) for every cached key of `uri`.
    pub fn execute_uri(&self, uri: &str, user: i32, meta: &StoreMetaData) {
        let keys: Vec<SubscriberKey> = self
            .cache
            .lock()
            .keys()
            .filter(|key| key.uri == uri)
            .cloned()
            .collect();
        for key in keys {
            self.execute(&key, user, meta);
        }
    }

    /// Re-arms every cached key, e.g. after the wall clock changed.
    pub fn re_execute_all(&self) {
        let entries: Vec<_> = self
            .cache
            .lock()
            .iter()
            .map(|(key, (user, meta))| (key.clone(), *user, meta.clone()))
            .collect();
        for (key, user, meta) in entries {
            self.execute(&key, user, &meta);
        }
    }

    /// Remembers how to re-arm `key`.
    pub fn add_to_cache(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData) {
        self.cache.lock().insert(key.clone(), (user, meta.clone()));
    }

    /// Forgets how to re-arm `key`.
    pub fn remove_from_cache(&self, key: &SubscriberKey) {
        self.cache.lock().remove(key);
    }

    /// Cancels the timer of `key`.
    pub fn remove_timer(&self, key: &SubscriberKey) {
        self.ever_stopped.lock().remove(key);
        let Some(timer) = self.timers.lock().remove(key) else {
            return;
        };
        if let Some(executor) = self.executor.read().as_ref() {
            executor.remove(timer.task);
        }
        debug!(uri = %anonymous::change(&key.uri), "timer removed");
    }

    /// Cancels every timer.
    pub fn clear_timer(&self) {
        let timers = std::mem::take(&mut *self.timers.lock());
        if let Some(executor) = self.executor.read().as_ref() {
            for timer in timers.values() {
                executor.remove(timer.task);
            }
        }
        self.ever_stopped.lock().clear();
    }

    /// Returns true if the schedule of `key` stopped because nobody listened.
    pub fn ever_stopped(&self, key: &SubscriberKey) -> bool {
        self.ever_stopped.lock().contains(key)
    }

    /// Sets or clears the stopped flag of `key`.
    pub fn set_ever_stopped(&self, key: &SubscriberKey, stopped: bool) {
        let mut flags = self.ever_stopped.lock();
        if stopped {
            flags.insert(key.clone());
        } else {
            flags.remove(key);
        }
    }

    /// Returns true if `key` has an armed timer.
    pub fn has_timer(&self, key: &SubscriberKey) -> bool {
        self.timers.lock().contains_key(key)
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    fn set_timer(&self, key: &SubscriberKey, user: i32, meta: StoreMetaData, at: i64) {
        let Some(executor) = self.executor.read().clone() else {
            warn!(uri = %anonymous::change(&key.uri), "scheduler not bound, timer dropped");
            return;
        };
        let delay = delay_until(at).max(self.config.min_interval);
        let generation = {
            let mut next = self.generation.lock();
            *next += 1;
            *next
        };
        let this = self.this.clone();
        let fired = key.clone();
        let mut timers = self.timers.lock();
        let task = executor.schedule(delay, move || {
            if let Some(manager) = this.upgrade() {
                manager.fire(&fired, user, &meta, generation);
            }
        });
        if let Some(old) = timers.insert(key.clone(), Timer { generation, task }) {
            executor.remove(old.task);
        }
        debug!(uri = %anonymous::change(&key.uri), delay_ms = delay.as_millis() as u64, "timer armed");
    }

    fn fire(&self, key: &SubscriberKey, user: i32, meta: &StoreMetaData, generation: u64) {
        {
            let mut timers = self.timers.lock();
            match timers.get(key) {
                Some(timer) if timer.generation == generation => {
                    timers.remove(key);
                }
                _ => return,
            }
        }
        let Some(target) = self.target.read().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if !target.is_enabled(key) {
            info!(
                uri = %anonymous::change(&key.uri),
                subscriber = key.subscriber_id,
                "no enabled observer, schedule stopped"
            );
            self.set_ever_stopped(key, true);
            return;
        }
        target.on_schedule(key, user, meta);
        self.execute(key, user, meta);
    }
}

impl Drop for SchedulerManager {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

impl std::fmt::Debug for SchedulerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerManager")
            .field("config", &self.config)
            .field("timers", &self.timer_count())
            .finish()
    }
}

fn delay_until(at: i64) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    Duration::from_secs(at.saturating_sub(now).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTemplateDataSource;
    use crate::template::{PredicateTemplateNode, Template};
    use ddms_core::metadata::MetaPlane;
    use ddms_core::{ExecutorConfig, MetaConfig};
    use ddms_storage::{KvDelegate, MemoryKvDelegate, StorageResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    const USER: i32 = 100;
    const REMIND: &str = "select remind_timer()";

    #[derive(Default)]
    struct Target {
        disabled: AtomicBool,
        fired: AtomicUsize,
    }

    impl ScheduleTarget for Target {
        fn is_enabled(&self, _key: &SubscriberKey) -> bool {
            !self.disabled.load(Ordering::SeqCst)
        }

        fn on_schedule(&self, _key: &SubscriberKey, _user: i32, _meta: &StoreMetaData) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        scheduler: Arc<SchedulerManager>,
        source: Arc<MemoryTemplateDataSource>,
        meta: Arc<MetaDataManager>,
        target: Arc<Target>,
        _executor: Arc<ExecutorPool>,
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
            SchedulerConfig::default().with_min_interval(Duration::from_millis(20)),
        );
        let executor = Arc::new(ExecutorPool::new(&ExecutorConfig::new(1, 2)).unwrap());
        scheduler.bind(Arc::clone(&executor));
        let target = Arc::new(Target::default());
        let weak: Weak<dyn ScheduleTarget> = Arc::downgrade(&target) as Weak<Target>;
        scheduler.set_target(weak);
        Fixture {
            scheduler,
            source,
            meta,
            target,
            _executor: executor,
        }
    }

    fn key() -> SubscriberKey {
        SubscriberKey::new("datashareproxy://com.example.mail/inbox", 1, "com.example.mail")
    }

    fn store() -> StoreMetaData {
        StoreMetaData::new("uuid", "100", "com.example.mail", "mail")
    }

    fn save_template(f: &Fixture, scheduler: &str) {
        let template = Template::new(vec![PredicateTemplateNode::new("k", "select 1")])
            .with_scheduler(scheduler);
        f.meta.save_meta(&key().template_key(USER), &template, true).unwrap();
    }

    fn an_hour_from_now() -> i64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        now + 3600
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn nothing_to_schedule_without_a_statement() {
        let f = fixture();
        f.scheduler.execute(&key(), USER, &store());
        save_template(&f, "");
        f.scheduler.execute(&key(), USER, &store());
        assert!(!f.scheduler.has_timer(&key()));
        assert!(f.source.calls().is_empty());
    }

    #[test]
    fn firing_notifies_and_rearms() {
        let f = fixture();
        save_template(&f, REMIND);
        f.source.set_remind_time(REMIND, Some(0));

        f.scheduler.execute(&key(), USER, &store());
        assert!(f.scheduler.has_timer(&key()));
        assert!(wait_until(|| f.target.fired.load(Ordering::SeqCst) >= 2));

        f.scheduler.remove_timer(&key());
        assert!(!f.scheduler.has_timer(&key()));
    }

    #[test]
    fn schedule_stops_when_nobody_listens() {
        let f = fixture();
        save_template(&f, REMIND);
        f.source.set_remind_time(REMIND, Some(0));
        f.target.disabled.store(true, Ordering::SeqCst);

        f.scheduler.execute(&key(), USER, &store());
        assert!(wait_until(|| f.scheduler.ever_stopped(&key())));
        assert!(!f.scheduler.has_timer(&key()));
        assert_eq!(f.target.fired.load(Ordering::SeqCst), 0);

        f.scheduler.set_ever_stopped(&key(), false);
        assert!(!f.scheduler.ever_stopped(&key()));
    }

    #[test]
    fn no_time_ends_the_schedule() {
        let f = fixture();
        save_template(&f, REMIND);
        f.source.set_remind_time(REMIND, Some(an_hour_from_now()));
        f.scheduler.execute(&key(), USER, &store());
        assert!(f.scheduler.has_timer(&key()));

        f.source.set_remind_time(REMIND, None);
        f.scheduler.execute(&key(), USER, &store());
        assert!(!f.scheduler.has_timer(&key()));
    }

    #[test]
    fn re_execute_all_uses_the_cache() {
        let f = fixture();
        save_template(&f, REMIND);
        f.source.set_remind_time(REMIND, Some(an_hour_from_now()));
        f.scheduler.add_to_cache(&key(), USER, &store());

        f.scheduler.re_execute_all();
        assert!(f.scheduler.has_timer(&key()));

        f.scheduler.clear_timer();
        f.scheduler.remove_from_cache(&key());
        f.scheduler.re_execute_all();
        assert_eq!(f.scheduler.timer_count(), 0);
    }

    #[test]
    fn statements_run_as_the_key_bundle_and_user() {
        let f = fixture();
        save_template(&f, REMIND);
        let mut other = store();
        other.store_id = "mail_store".into();
        f.scheduler.execute(&key(), USER, &other);
        assert_eq!(
            f.source.calls(),
            vec![crate::source::SourceCall::Remind {
                store_id: "mail_store".into(),
                sql: REMIND.into(),
            }]
        );
    }
}
