use crate::error::StoreResult;
use crate::value::Value;
use std::collections::BTreeMap;

/// Where a data change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Match every origin when watching.
    All,
    /// Written by the application on this device.
    Local,
    /// Downloaded from the cloud.
    Cloud,
    /// Received from a nearby device.
    Nearby,
}

impl Origin {
    /// Returns true if a watcher registered for `self` wants `origin`.
    pub fn matches(self, origin: Origin) -> bool {
        self == Origin::All || self == origin
    }
}

/// Primary keys changed in one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableChange {
    /// Inserted rows.
    pub inserted: Vec<Value>,
    /// Updated rows.
    pub updated: Vec<Value>,
    /// Deleted rows.
    pub deleted: Vec<Value>,
}

impl TableChange {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// A batch of changes grouped by table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInfo {
    /// Source of the change.
    pub origin: Origin,
    /// Store the change happened in.
    pub store: String,
    /// Table name to changed keys.
    pub tables: BTreeMap<String, TableChange>,
}

/// Receives data changes from a store.
pub trait Watcher: Send + Sync {
    /// Called after changes were committed.
    fn on_change(&self, change: &ChangeInfo) -> StoreResult<()>;
}
