//! The store a template runs against.

use crate::error::{ShareError, ShareResult};
use crate::observer::PublishedValue;
use crate::published::PublishedDataKey;
use ddms_core::metadata::StoreMetaData;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};

/// Data behind template and published data subscriptions.
///
/// `meta` names the store (bundle, user, store id and data directory) and
/// `uri` the subscribed URI the statement belongs to.
pub trait TemplateDataSource: Send + Sync {
    /// Runs a predicate query. Returns its rows as JSON text, or an empty
    /// string when nothing matched.
    fn query(&self, meta: &StoreMetaData, uri: &str, sql: &str) -> ShareResult<String>;

    /// Runs an update statement. Returns the number of rows changed.
    fn update(&self, meta: &StoreMetaData, uri: &str, sql: &str) -> ShareResult<u64>;

    /// Runs a scheduler statement. Returns the next fire time in epoch
    /// seconds, or `None` when the schedule should stop.
    fn remind_time(&self, meta: &StoreMetaData, uri: &str, sql: &str) -> ShareResult<Option<i64>>;

    /// Loads the value published under `key` for `user`.
    fn published(&self, key: &PublishedDataKey, user: i32) -> ShareResult<Option<PublishedValue>>;
}

/// A statement run against a [`MemoryTemplateDataSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    /// A predicate query.
    Query {
        /// Store the query ran on.
        store_id: String,
        /// Statement text.
        sql: String,
    },
    /// An update statement.
    Update {
        /// Store the update ran on.
        store_id: String,
        /// Statement text.
        sql: String,
    },
    /// A scheduler statement.
    Remind {
        /// Store the statement ran on.
        store_id: String,
        /// Statement text.
        sql: String,
    },
}

/// In-memory data source with programmable answers.
///
/// Statements are matched by their exact text. Unknown queries match
/// nothing, unknown updates change no rows and unknown scheduler
/// statements stop the schedule.
#[derive(Default)]
pub struct MemoryTemplateDataSource {
    results: RwLock<BTreeMap<String, String>>,
    remind: RwLock<BTreeMap<String, i64>>,
    published: RwLock<BTreeMap<(PublishedDataKey, i32), PublishedValue>>,
    failing: RwLock<BTreeSet<String>>,
    calls: Mutex<Vec<SourceCall>>,
}

impl MemoryTemplateDataSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the JSON rows `sql` returns.
    pub fn set_result(&self, sql: impl Into<String>, rows: impl Into<String>) {
        self.results.write().insert(sql.into(), rows.into());
    }

    /// Sets the next fire time `sql` returns, or stops the schedule.
    pub fn set_remind_time(&self, sql: impl Into<String>, at: Option<i64>) {
        let sql = sql.into();
        match at {
            Some(at) => self.remind.write().insert(sql, at),
            None => self.remind.write().remove(&sql),
        };
    }

    /// Publishes `value` under `key` for `user`.
    pub fn publish(&self, key: PublishedDataKey, user: i32, value: PublishedValue) {
        self.published.write().insert((key, user), value);
    }

    /// Makes every statement with this text fail.
    pub fn fail(&self, sql: impl Into<String>) {
        self.failing.write().insert(sql.into());
    }

    /// Statements run so far.
    pub fn calls(&self) -> Vec<SourceCall> {
        self.calls.lock().clone()
    }

    /// Update statements run so far.
    pub fn updates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SourceCall::Update { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    fn check(&self, sql: &str) -> ShareResult<()> {
        if self.failing.read().contains(sql) {
            return Err(ShareError::data_source(format!("statement failed: {sql}")));
        }
        Ok(())
    }
}

impl TemplateDataSource for MemoryTemplateDataSource {
    fn query(&self, meta: &StoreMetaData, _uri: &str, sql: &str) -> ShareResult<String> {
        self.calls.lock().push(SourceCall::Query {
            store_id: meta.store_id.clone(),
            sql: sql.to_string(),
        });
        self.check(sql)?;
        Ok(self.results.read().get(sql).cloned().unwrap_or_default())
    }

    fn update(&self, meta: &StoreMetaData, _uri: &str, sql: &str) -> ShareResult<u64> {
        self.calls.lock().push(SourceCall::Update {
            store_id: meta.store_id.clone(),
            sql: sql.to_string(),
        });
        self.check(sql)?;
        Ok(1)
    }

    fn remind_time(&self, meta: &StoreMetaData, _uri: &str, sql: &str) -> ShareResult<Option<i64>> {
        self.calls.lock().push(SourceCall::Remind {
            store_id: meta.store_id.clone(),
            sql: sql.to_string(),
        });
        self.check(sql)?;
        Ok(self.remind.read().get(sql).copied())
    }

    fn published(&self, key: &PublishedDataKey, user: i32) -> ShareResult<Option<PublishedValue>> {
        Ok(self.published.read().get(&(key.clone(), user)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> StoreMetaData {
        StoreMetaData::new("uuid", "100", "com.example.mail", "mail")
    }

    #[test]
    fn answers_are_programmable() {
        let source = MemoryTemplateDataSource::new();
        source.set_result("select 1", "[1]");
        source.set_remind_time("remind", Some(42));

        assert_eq!(source.query(&meta(), "u", "select 1").unwrap(), "[1]");
        assert_eq!(source.query(&meta(), "u", "select 2").unwrap(), "");
        assert_eq!(source.remind_time(&meta(), "u", "remind").unwrap(), Some(42));

        source.set_remind_time("remind", None);
        assert_eq!(source.remind_time(&meta(), "u", "remind").unwrap(), None);
        assert_eq!(source.calls().len(), 4);
    }

    #[test]
    fn failing_statements_still_record() {
        let source = MemoryTemplateDataSource::new();
        source.fail("update t");
        assert!(matches!(
            source.update(&meta(), "u", "update t"),
            Err(ShareError::DataSource(_))
        ));
        assert_eq!(source.updates(), vec!["update t"]);
    }
}
