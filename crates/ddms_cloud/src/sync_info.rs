//! A cloud sync request.

use ddms_core::metadata::Database;
use ddms_core::store::{sync_mode, DetailAsync, GenDetails, GenQuery, ProgressDetail};
use ddms_core::GeneralError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Account id meaning "whichever account is current".
pub const DEFAULT_ID: &str = "default";

const USER_SHIFT: u32 = 32;
const USER_MASK: u64 = 0xFFFF_FFFF_0000_0000;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Allocates a sync id carrying `user` in its upper half.
pub fn generate_id(user: i32) -> u64 {
    let user = u64::from(user as u32);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (user << USER_SHIFT) | u64::from(seq)
}

/// Returns true if `sync_id` was allocated for `user`.
pub fn compare(sync_id: u64, user: i32) -> bool {
    (sync_id & USER_MASK) == (u64::from(user as u32) << USER_SHIFT)
}

/// What to sync for whom.
///
/// `tables` maps a store name to the tables of interest; an empty map
/// selects every store of the bundle and an empty table list every table
/// of the store.
#[derive(Clone)]
pub struct SyncInfo {
    /// Local user.
    pub user: i32,
    /// Bundle to sync; empty for every bundle with its switch on.
    pub bundle_name: String,
    /// Store name to table names or aliases.
    pub tables: BTreeMap<String, Vec<String>>,
    /// Sync mode including its trigger bits.
    pub mode: i32,
    /// How long a caller waits for completion.
    pub wait: Duration,
    /// Explicit query overriding the table selection.
    pub query: Option<GenQuery>,
    /// Receives progress and the final outcome.
    pub on_detail: Option<DetailAsync>,
    /// Cloud account the request is bound to.
    pub id: String,
    sync_id: u64,
}

impl SyncInfo {
    /// Syncs every enabled bundle of `user`.
    pub fn new(user: i32) -> Self {
        Self {
            user,
            bundle_name: String::new(),
            tables: BTreeMap::new(),
            mode: sync_mode::mix_mode(sync_mode::CLOUD_TIME_FIRST, sync_mode::AUTO_SYNC_MODE),
            wait: Duration::ZERO,
            query: None,
            on_detail: None,
            id: DEFAULT_ID.to_string(),
            sync_id: generate_id(user),
        }
    }

    /// Restricts the request to one bundle.
    #[must_use]
    pub fn with_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle_name = bundle.into();
        self
    }

    /// Restricts the request to one store and, optionally, some of its tables.
    #[must_use]
    pub fn with_store(mut self, store: impl Into<String>, tables: Vec<String>) -> Self {
        let store = store.into();
        if !store.is_empty() {
            self.tables.insert(store, tables);
        }
        self
    }

    /// Replaces the store to tables selection.
    #[must_use]
    pub fn with_tables(mut self, tables: BTreeMap<String, Vec<String>>) -> Self {
        self.tables = tables;
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub fn with_mode(mut self, mode: i32) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the wait time.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets an explicit query.
    #[must_use]
    pub fn with_query(mut self, query: GenQuery) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_callback(mut self, callback: DetailAsync) -> Self {
        self.on_detail = Some(callback);
        self
    }

    /// Binds the request to a cloud account.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Id allocated when the request was created.
    pub fn sync_id(&self) -> u64 {
        self.sync_id
    }

    /// Returns true for a manually triggered request.
    pub fn is_priority(&self) -> bool {
        sync_mode::is_priority(self.mode)
    }

    /// Returns true if the store named `store` is selected.
    pub fn selects(&self, store: &str) -> bool {
        self.tables.is_empty() || self.tables.contains_key(store)
    }

    /// Query to run against `database`.
    ///
    /// Requested tables are matched by name or alias; tables the database
    /// does not have are dropped. Returns `None` if none of the requested
    /// tables exist.
    pub fn generate_query(&self, database: &Database) -> Option<GenQuery> {
        if let Some(query) = &self.query {
            return Some(query.clone());
        }
        let Some(wanted) = self.tables.get(&database.name).filter(|t| !t.is_empty()) else {
            return Some(GenQuery::tables(database.table_names()));
        };
        let tables: Vec<String> = database
            .tables
            .iter()
            .filter(|t| wanted.contains(&t.name) || wanted.contains(&t.alias))
            .map(|t| t.name.clone())
            .collect();
        (!tables.is_empty()).then(|| GenQuery::tables(tables))
    }

    /// Reports a final failure to the callback, if any.
    pub fn set_error(&self, code: GeneralError) {
        if let Some(callback) = &self.on_detail {
            let mut details = GenDetails::new();
            details.insert(self.id.clone(), ProgressDetail::finished(Err(code)));
            callback(&details);
        }
    }

    /// Key under which equivalent pending requests are merged.
    pub(crate) fn merge_key(&self) -> MergeKey {
        MergeKey {
            user: self.user,
            bundle: self.bundle_name.clone(),
            tables: self.tables.clone(),
        }
    }
}

impl std::fmt::Debug for SyncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncInfo")
            .field("user", &self.user)
            .field("bundle_name", &self.bundle_name)
            .field("tables", &self.tables)
            .field("mode", &self.mode)
            .field("sync_id", &self.sync_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MergeKey {
    user: i32,
    bundle: String,
    tables: BTreeMap<String, Vec<String>>,
}

impl MergeKey {
    pub(crate) fn user(&self) -> i32 {
        self.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddms_core::metadata::Table;
    use ddms_core::store::Progress;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn database() -> Database {
        let table = |name: &str, alias: &str| Table {
            name: name.into(),
            alias: alias.into(),
            ..Table::default()
        };
        Database {
            name: "notes.db".into(),
            alias: "notes".into(),
            tables: vec![table("note", "cloud_note"), table("tag", "cloud_tag")],
            ..Database::default()
        }
    }

    #[test]
    fn ids_carry_the_user() {
        let a = generate_id(100);
        let b = generate_id(100);
        assert_ne!(a, b);
        assert!(compare(a, 100));
        assert!(!compare(a, 101));
        assert!(compare(generate_id(-1), -1));
        assert!(!compare(a, -1));
    }

    proptest::proptest! {
        #[test]
        fn any_user_is_recovered_from_its_ids(user in proptest::prelude::any::<i32>(), other in proptest::prelude::any::<i32>()) {
            let id = generate_id(user);
            proptest::prop_assert!(compare(id, user));
            proptest::prop_assert_eq!(compare(id, other), user == other);
        }
    }

    #[test]
    fn query_defaults_to_every_table() {
        let info = SyncInfo::new(100);
        assert_eq!(info.generate_query(&database()).unwrap().tables, vec!["note", "tag"]);
        assert!(info.selects("anything"));
    }

    #[test]
    fn tables_match_by_alias() {
        let info = SyncInfo::new(100).with_store("notes.db", vec!["cloud_tag".into(), "gone".into()]);
        assert_eq!(info.generate_query(&database()).unwrap().tables, vec!["tag"]);
        assert!(info.selects("notes.db"));
        assert!(!info.selects("other.db"));

        let info = SyncInfo::new(100).with_store("notes.db", vec!["gone".into()]);
        assert!(info.generate_query(&database()).is_none());
    }

    #[test]
    fn explicit_query_wins() {
        let info = SyncInfo::new(100).with_query(GenQuery::tables(vec!["x".into()]));
        assert_eq!(info.generate_query(&database()).unwrap().tables, vec!["x"]);
    }

    #[test]
    fn set_error_reports_finished() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let info = SyncInfo::new(100).with_callback(Arc::new(move |d: &GenDetails| {
            sink.lock().push(d.clone());
        }));
        info.set_error(GeneralError::Unopened);
        let seen = seen.lock();
        let detail = &seen[0][DEFAULT_ID];
        assert_eq!(detail.progress, Progress::Finished);
        assert_eq!(detail.code, Err(GeneralError::Unopened));
    }

    #[test]
    fn merge_key_ignores_sync_id() {
        let a = SyncInfo::new(100).with_bundle("b");
        let b = SyncInfo::new(100).with_bundle("b");
        assert_ne!(a.sync_id(), b.sync_id());
        assert_eq!(a.merge_key(), b.merge_key());
        assert_ne!(a.merge_key(), SyncInfo::new(101).with_bundle("b").merge_key());
    }
}
