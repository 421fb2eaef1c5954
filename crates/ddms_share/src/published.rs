//! Observers of published data.

use crate::error::{ShareError, ShareResult};
use crate::observer::{
    Caller, ObserverHandle, ObserverId, PublishedDataChangeNode, PublishedDataObserver,
    PublishedItem, PublishedValue,
};
use crate::source::TemplateDataSource;
use crate::uri::bundle_from_proxy_uri;
use ddms_core::anonymous;
use ddms_core::ConcurrentMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Identifies a published data item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublishedDataKey {
    /// Published key, a proxy URI or a plain name.
    pub key: String,
    /// Bundle that publishes the item.
    pub bundle_name: String,
    /// Subscriber id the item is published for.
    pub subscriber_id: i64,
}

impl PublishedDataKey {
    /// Creates a key.
    ///
    /// When `key` is a proxy URI its authority names the bundle and
    /// overrides `bundle_name`.
    pub fn new(key: impl Into<String>, bundle_name: impl Into<String>, subscriber_id: i64) -> Self {
        let key = key.into();
        let bundle_name = bundle_from_proxy_uri(&key)
            .map(str::to_string)
            .unwrap_or_else(|| bundle_name.into());
        Self {
            key,
            bundle_name,
            subscriber_id,
        }
    }
}

/// One observer registered under a [`PublishedDataKey`].
#[derive(Debug, Clone)]
pub struct PublishedObserverNode {
    /// Callback handle.
    pub observer: ObserverHandle<dyn PublishedDataObserver>,
    /// Who registered it.
    pub caller: Caller,
    /// Disabled observers are skipped on delivery.
    pub enabled: bool,
    /// Set when a change was skipped while disabled.
    pub notify_on_enabled: bool,
}

/// Registry of published data subscriptions.
pub struct PublishedDataSubscriberManager {
    this: Weak<Self>,
    observers: ConcurrentMap<PublishedDataKey, Vec<PublishedObserverNode>>,
    source: Arc<dyn TemplateDataSource>,
}

impl PublishedDataSubscriberManager {
    /// Creates an empty registry reading published values from `source`.
    pub fn new(source: Arc<dyn TemplateDataSource>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            observers: ConcurrentMap::new(),
            source,
        })
    }

    /// Registers `observer` under `key` and removes it when its process dies.
    pub fn add(
        &self,
        key: &PublishedDataKey,
        observer: ObserverHandle<dyn PublishedDataObserver>,
        caller: Caller,
    ) -> ShareResult<()> {
        info!(key = %anonymous::change(&key.key), token = caller.token_id, "add publish subscriber");
        let this = self.this.clone();
        let dead_key = key.clone();
        if !observer.link_to_death(move |id| {
            if let Some(manager) = this.upgrade() {
                manager.on_remote_died(&dead_key, id);
            }
        }) {
            warn!(key = %anonymous::change(&key.key), "observer already dead");
            return Err(ShareError::InvalidArgument("observer is dead".into()));
        }
        self.observers.compute(key.clone(), |_, nodes| {
            nodes.push(PublishedObserverNode {
                observer,
                caller,
                enabled: true,
                notify_on_enabled: false,
            });
            true
        });
        Ok(())
    }

    /// Removes the observers `token` registered under `key`.
    pub fn delete(&self, key: &PublishedDataKey, token_id: u32) -> ShareResult<()> {
        let mut found = false;
        self.observers.compute_if_present(key, |_, nodes| {
            found = true;
            nodes.retain(|node| node.caller.token_id != token_id);
            !nodes.is_empty()
        });
        found.then_some(()).ok_or(ShareError::SubscriberNotExist)
    }

    /// Removes every observer registered by the process `(token, pid)`.
    pub fn delete_by_process(&self, token_id: u32, pid: u32) {
        let removed = self.observers.erase_if(|_, nodes| {
            nodes.retain(|node| node.caller != Caller::new(token_id, pid));
            nodes.is_empty()
        });
        debug!(token = token_id, removed, "process subscriptions removed");
    }

    /// Stops delivering to the observers `token` registered under `key`.
    pub fn disable(&self, key: &PublishedDataKey, token_id: u32) -> ShareResult<()> {
        self.set_enabled(key, token_id, false)
    }

    /// Resumes delivering to the observers `token` registered under `key`.
    pub fn enable(&self, key: &PublishedDataKey, token_id: u32) -> ShareResult<()> {
        self.set_enabled(key, token_id, true)
    }

    /// Returns true if an observer of `token` under `key` missed a change
    /// while disabled.
    pub fn is_notify_on_enabled(&self, key: &PublishedDataKey, token_id: u32) -> bool {
        self.observers.get(key).is_some_and(|nodes| {
            nodes
                .iter()
                .any(|n| n.caller.token_id == token_id && n.notify_on_enabled)
        })
    }

    /// Flags the disabled observers of `keys` as having missed a change.
    pub fn set_observers_notify_on_enabled(&self, keys: &[PublishedDataKey]) {
        for key in keys {
            self.observers.compute_if_present(key, |_, nodes| {
                for node in nodes.iter_mut().filter(|n| !n.enabled) {
                    node.notify_on_enabled = true;
                }
                true
            });
        }
    }

    /// Delivers the current values of `keys` published by `owner`.
    ///
    /// Each enabled observer receives one payload with the items it
    /// subscribed to; observers with nothing to deliver are skipped. With
    /// `only` set, only that observer is notified. Returns the number of
    /// observers notified.
    pub fn emit(
        &self,
        keys: &[PublishedDataKey],
        user: i32,
        owner: &str,
        only: Option<&ObserverHandle<dyn PublishedDataObserver>>,
    ) -> usize {
        let mut values: BTreeMap<PublishedDataKey, PublishedValue> = BTreeMap::new();
        let mut targets: BTreeMap<ObserverId, (ObserverHandle<dyn PublishedDataObserver>, Vec<PublishedDataKey>)> =
            BTreeMap::new();
        for key in keys {
            if values.contains_key(key) {
                continue;
            }
            let Some(nodes) = self.observers.get(key) else {
                continue;
            };
            match self.source.published(key, user) {
                Ok(Some(value)) => {
                    values.insert(key.clone(), value);
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        key = %anonymous::change(&key.key),
                        bundle = %key.bundle_name,
                        subscriber = key.subscriber_id,
                        error = %err,
                        "query published data failed"
                    );
                    continue;
                }
            }
            for node in nodes.iter().filter(|n| n.enabled && n.observer.is_alive()) {
                if only.is_some_and(|only| *only != node.observer) {
                    continue;
                }
                targets
                    .entry(node.observer.id())
                    .or_insert_with(|| (node.observer.clone(), Vec::new()))
                    .1
                    .push(key.clone());
            }
        }

        let mut notified = 0;
        for (observer, subscribed) in targets.into_values() {
            let datas: Vec<PublishedItem> = subscribed
                .iter()
                .filter_map(|key| {
                    values.get(key).map(|value| PublishedItem {
                        key: key.key.clone(),
                        subscriber_id: key.subscriber_id,
                        value: value.clone(),
                    })
                })
                .collect();
            if datas.is_empty() {
                continue;
            }
            observer
                .callback()
                .on_change_from_published_data(&PublishedDataChangeNode {
                    owner_bundle_name: owner.to_string(),
                    datas,
                });
            notified += 1;
        }
        notified
    }

    /// Removes the observer whose process died.
    pub fn on_remote_died(&self, key: &PublishedDataKey, observer: ObserverId) {
        self.observers.compute_if_present(key, |key, nodes| {
            if let Some(pos) = nodes.iter().position(|n| n.observer.id() == observer) {
                nodes.remove(pos);
                info!(key = %anonymous::change(&key.key), "observer died, subscriber removed");
            }
            !nodes.is_empty()
        });
    }

    /// Number of subscribed keys.
    pub fn get_count(&self) -> usize {
        self.observers.len()
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.observers.clear();
    }

    fn set_enabled(&self, key: &PublishedDataKey, token_id: u32, enabled: bool) -> ShareResult<()> {
        let found = self.observers.compute_if_present(key, |_, nodes| {
            for node in nodes.iter_mut().filter(|n| n.caller.token_id == token_id) {
                node.enabled = enabled;
                if enabled {
                    node.notify_on_enabled = false;
                }
            }
            true
        });
        found.then_some(()).ok_or(ShareError::SubscriberNotExist)
    }
}

impl std::fmt::Debug for PublishedDataSubscriberManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedDataSubscriberManager")
            .field("keys", &self.get_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::source::MemoryTemplateDataSource;

    const USER: i32 = 100;
    const OWNER: &str = "com.example.weather";

    fn fixture() -> (Arc<PublishedDataSubscriberManager>, Arc<MemoryTemplateDataSource>) {
        let source = Arc::new(MemoryTemplateDataSource::new());
        (PublishedDataSubscriberManager::new(Arc::clone(&source) as _), source)
    }

    fn observer() -> (Arc<RecordingObserver>, ObserverHandle<dyn PublishedDataObserver>) {
        let recorder = RecordingObserver::new();
        let handle = ObserverHandle::<dyn PublishedDataObserver>::new(Arc::clone(&recorder) as _);
        (recorder, handle)
    }

    fn key(name: &str) -> PublishedDataKey {
        PublishedDataKey::new(name, OWNER, 1)
    }

    #[test]
    fn proxy_uri_names_the_bundle() {
        let key = PublishedDataKey::new("datashareproxy://com.example.news/top", "ignored", 3);
        assert_eq!(key.bundle_name, "com.example.news");
        assert_eq!(PublishedDataKey::new("top", "com.example.news", 3).bundle_name, "com.example.news");
    }

    #[test]
    fn emit_groups_items_per_observer() {
        let (manager, source) = fixture();
        source.publish(key("temp"), USER, PublishedValue::Text("21".into()));
        source.publish(key("wind"), USER, PublishedValue::Bytes(vec![3]));

        let (both, both_handle) = observer();
        let (wind, wind_handle) = observer();
        manager.add(&key("temp"), both_handle.clone(), Caller::new(1, 10)).unwrap();
        manager.add(&key("wind"), both_handle, Caller::new(1, 10)).unwrap();
        manager.add(&key("wind"), wind_handle, Caller::new(2, 20)).unwrap();

        let notified = manager.emit(&[key("temp"), key("wind"), key("rain")], USER, OWNER, None);
        assert_eq!(notified, 2);

        let got = both.published_changes();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].owner_bundle_name, OWNER);
        let names: Vec<_> = got[0].datas.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(names, vec!["temp", "wind"]);
        assert_eq!(wind.published_changes()[0].datas.len(), 1);
    }

    #[test]
    fn observers_with_nothing_to_deliver_are_skipped() {
        let (manager, _source) = fixture();
        let (recorder, handle) = observer();
        manager.add(&key("temp"), handle, Caller::new(1, 10)).unwrap();
        assert_eq!(manager.emit(&[key("temp")], USER, OWNER, None), 0);
        assert!(recorder.published_changes().is_empty());
    }

    #[test]
    fn emit_can_target_one_observer() {
        let (manager, source) = fixture();
        source.publish(key("temp"), USER, PublishedValue::Text("21".into()));
        let (first, first_handle) = observer();
        let (second, second_handle) = observer();
        manager.add(&key("temp"), first_handle.clone(), Caller::new(1, 10)).unwrap();
        manager.add(&key("temp"), second_handle, Caller::new(2, 20)).unwrap();

        assert_eq!(manager.emit(&[key("temp")], USER, OWNER, Some(&first_handle)), 1);
        assert_eq!(first.published_changes().len(), 1);
        assert!(second.published_changes().is_empty());
    }

    #[test]
    fn disabled_observers_are_flagged_until_enabled() {
        let (manager, source) = fixture();
        source.publish(key("temp"), USER, PublishedValue::Text("21".into()));
        let (recorder, handle) = observer();
        manager.add(&key("temp"), handle, Caller::new(1, 10)).unwrap();

        manager.disable(&key("temp"), 1).unwrap();
        assert_eq!(manager.emit(&[key("temp")], USER, OWNER, None), 0);
        manager.set_observers_notify_on_enabled(&[key("temp")]);
        assert!(manager.is_notify_on_enabled(&key("temp"), 1));
        assert!(recorder.published_changes().is_empty());

        manager.enable(&key("temp"), 1).unwrap();
        assert!(!manager.is_notify_on_enabled(&key("temp"), 1));
        assert!(matches!(manager.enable(&key("rain"), 1), Err(ShareError::SubscriberNotExist)));
    }

    #[test]
    fn death_and_process_cleanup() {
        let (manager, _source) = fixture();
        let (_, a) = observer();
        let (_, b) = observer();
        manager.add(&key("temp"), a.clone(), Caller::new(1, 10)).unwrap();
        manager.add(&key("wind"), b, Caller::new(2, 20)).unwrap();

        a.kill();
        assert_eq!(manager.get_count(), 1);
        assert!(matches!(
            manager.add(&key("temp"), a, Caller::new(1, 10)),
            Err(ShareError::InvalidArgument(_))
        ));

        manager.delete_by_process(2, 20);
        assert_eq!(manager.get_count(), 0);
        assert!(matches!(manager.delete(&key("wind"), 2), Err(ShareError::SubscriberNotExist)));
    }
}
