//! Bridges engine change notifications to the store's watcher.

use crate::engine::{EngineChange, EngineObserver, EngineOrigin};
use ddms_core::anonymous;
use ddms_core::store::{ChangeInfo, Origin, TableChange, Watcher};
use ddms_core::{GeneralError, StoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine family the proxy reports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyKind {
    /// KV changes are reported under the store id as the table.
    Kv,
    /// Relational changes keep their table name.
    Relational,
}

/// Holds the single watcher of a store and feeds it engine changes.
pub(crate) struct ObserverProxy {
    store_id: String,
    kind: ProxyKind,
    watcher: RwLock<Option<Arc<dyn Watcher>>>,
}

impl ObserverProxy {
    pub(crate) fn new(store_id: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            store_id: store_id.into(),
            kind,
            watcher: RwLock::new(None),
        }
    }

    /// Installs the watcher. Only `Origin::All` is accepted, and only once.
    pub(crate) fn watch(&self, origin: Origin, watcher: Arc<dyn Watcher>) -> StoreResult<()> {
        let mut slot = self.watcher.write();
        if origin != Origin::All || slot.is_some() {
            return Err(GeneralError::InvalidArgs);
        }
        *slot = Some(watcher);
        Ok(())
    }

    /// Removes the watcher installed by [`ObserverProxy::watch`].
    pub(crate) fn unwatch(&self, origin: Origin, watcher: &Arc<dyn Watcher>) -> StoreResult<()> {
        let mut slot = self.watcher.write();
        let same = slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, watcher));
        if origin != Origin::All || !same {
            return Err(GeneralError::InvalidArgs);
        }
        *slot = None;
        Ok(())
    }

    pub(crate) fn has_watcher(&self) -> bool {
        self.watcher.read().is_some()
    }

    fn map_origin(&self, origin: EngineOrigin) -> Origin {
        match (self.kind, origin) {
            (_, EngineOrigin::Cloud) => Origin::Cloud,
            (ProxyKind::Relational, EngineOrigin::Local) => Origin::Local,
            _ => Origin::Nearby,
        }
    }
}

impl EngineObserver for ObserverProxy {
    fn on_change(&self, origin: EngineOrigin, original_id: &str, change: &EngineChange) {
        let Some(watcher) = self.watcher.read().clone() else {
            return;
        };
        let table = match self.kind {
            ProxyKind::Kv => self.store_id.clone(),
            ProxyKind::Relational => change.table.clone(),
        };
        debug!(
            store = %anonymous::change(&self.store_id),
            table = %anonymous::change(&table),
            from = %anonymous::change(original_id),
            "data changed"
        );
        let mut tables = BTreeMap::new();
        tables.insert(
            table,
            TableChange {
                inserted: change.inserted.clone(),
                updated: change.updated.clone(),
                deleted: change.deleted.clone(),
            },
        );
        let info = ChangeInfo {
            origin: self.map_origin(origin),
            store: self.store_id.clone(),
            tables,
        };
        if let Err(err) = watcher.on_change(&info) {
            warn!(store = %anonymous::change(&self.store_id), error = %err, "watcher rejected change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddms_core::Value;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ChangeInfo>>);

    impl Watcher for Recorder {
        fn on_change(&self, change: &ChangeInfo) -> StoreResult<()> {
            self.0.lock().push(change.clone());
            Ok(())
        }
    }

    fn change(table: &str) -> EngineChange {
        EngineChange {
            table: table.into(),
            inserted: vec![Value::Integer(1)],
            ..EngineChange::default()
        }
    }

    #[test]
    fn single_watcher_for_all_origins() {
        let proxy = ObserverProxy::new("store", ProxyKind::Kv);
        let first: Arc<dyn Watcher> = Arc::new(Recorder::default());
        let second: Arc<dyn Watcher> = Arc::new(Recorder::default());
        assert_eq!(
            proxy.watch(Origin::Cloud, Arc::clone(&first)),
            Err(GeneralError::InvalidArgs)
        );
        proxy.watch(Origin::All, Arc::clone(&first)).unwrap();
        assert_eq!(
            proxy.watch(Origin::All, Arc::clone(&second)),
            Err(GeneralError::InvalidArgs)
        );
        assert_eq!(proxy.unwatch(Origin::All, &second), Err(GeneralError::InvalidArgs));
        proxy.unwatch(Origin::All, &first).unwrap();
        assert!(!proxy.has_watcher());
    }

    #[test]
    fn kv_changes_use_store_id() {
        let proxy = ObserverProxy::new("store", ProxyKind::Kv);
        let recorder = Arc::new(Recorder::default());
        proxy.watch(Origin::All, Arc::clone(&recorder) as Arc<dyn Watcher>).unwrap();
        proxy.on_change(EngineOrigin::Remote, "peer", &change(""));
        proxy.on_change(EngineOrigin::Local, "", &change(""));
        let seen = recorder.0.lock();
        assert_eq!(seen[0].origin, Origin::Nearby);
        assert_eq!(seen[1].origin, Origin::Nearby);
        assert!(seen[0].tables.contains_key("store"));
    }

    #[test]
    fn relational_changes_keep_table() {
        let proxy = ObserverProxy::new("store", ProxyKind::Relational);
        let recorder = Arc::new(Recorder::default());
        proxy.watch(Origin::All, Arc::clone(&recorder) as Arc<dyn Watcher>).unwrap();
        proxy.on_change(EngineOrigin::Local, "", &change("t1"));
        proxy.on_change(EngineOrigin::Cloud, "", &change("t2"));
        let seen = recorder.0.lock();
        assert_eq!(seen[0].origin, Origin::Local);
        assert_eq!(seen[1].origin, Origin::Cloud);
        assert_eq!(seen[1].tables["t2"].inserted, vec![Value::Integer(1)]);
    }
}
