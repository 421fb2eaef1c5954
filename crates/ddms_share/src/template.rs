//! Templates: the queries behind a template subscription.

use crate::error::{ShareError, ShareResult};
use crate::scheduler::SchedulerManager;
use ddms_core::anonymous;
use ddms_core::metadata::join_key;
use ddms_core::MetaDataManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

const TEMPLATE_PREFIX: &str = "DataShareTemplate";

/// Identifies a template subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberKey {
    /// Subscribed URI.
    pub uri: String,
    /// Subscriber id chosen by the subscribing app.
    pub subscriber_id: i64,
    /// Bundle that owns the template.
    pub bundle_name: String,
}

impl SubscriberKey {
    /// Creates a key.
    pub fn new(uri: impl Into<String>, subscriber_id: i64, bundle_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            subscriber_id,
            bundle_name: bundle_name.into(),
        }
    }

    /// Metadata key of the template registered under this key for `user`.
    pub fn template_key(&self, user: i32) -> String {
        join_key(
            TEMPLATE_PREFIX,
            &[
                &user.to_string(),
                &self.bundle_name,
                &self.subscriber_id.to_string(),
                &self.uri,
            ],
        )
    }
}

/// A named predicate of a template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PredicateTemplateNode {
    /// Name the result is delivered under.
    pub key: String,
    /// Query producing the result.
    pub select_sql: String,
}

impl PredicateTemplateNode {
    /// Creates a predicate.
    pub fn new(key: impl Into<String>, select_sql: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            select_sql: select_sql.into(),
        }
    }
}

/// Queries evaluated for a template subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Template {
    /// Predicates evaluated on every notification.
    pub predicates: Vec<PredicateTemplateNode>,
    /// Statement yielding the next scheduled evaluation; empty for none.
    pub scheduler: String,
    /// Statement run after the predicates; empty for none.
    pub update: String,
}

impl Template {
    /// Creates a template from its predicates.
    pub fn new(predicates: Vec<PredicateTemplateNode>) -> Self {
        Self {
            predicates,
            ..Self::default()
        }
    }

    /// Sets the scheduler statement.
    #[must_use]
    pub fn with_scheduler(mut self, sql: impl Into<String>) -> Self {
        self.scheduler = sql.into();
        self
    }

    /// Sets the update statement.
    #[must_use]
    pub fn with_update(mut self, sql: impl Into<String>) -> Self {
        self.update = sql.into();
        self
    }
}

pub(crate) fn load_template(
    meta: &MetaDataManager,
    key: &SubscriberKey,
    user: i32,
) -> ShareResult<Template> {
    meta.try_load_meta(&key.template_key(user), true)?
        .ok_or(ShareError::TemplateNotExist)
}

/// Persists templates in the local metadata plane.
pub struct TemplateManager {
    meta: Arc<MetaDataManager>,
    scheduler: Arc<SchedulerManager>,
}

impl TemplateManager {
    /// Creates a manager storing templates in `meta`.
    pub fn new(meta: Arc<MetaDataManager>, scheduler: Arc<SchedulerManager>) -> Self {
        Self { meta, scheduler }
    }

    /// Registers or replaces the template of `key` for `user`.
    pub fn add(&self, key: &SubscriberKey, user: i32, template: &Template) -> ShareResult<()> {
        if key.uri.is_empty() {
            return Err(ShareError::InvalidArgument("empty uri".into()));
        }
        self.meta
            .save_meta(&key.template_key(user), template, true)
            .inspect_err(|err| {
                error!(uri = %anonymous::change(&key.uri), error = %err, "failed to add template");
            })?;
        info!(
            uri = %anonymous::change(&key.uri),
            subscriber = key.subscriber_id,
            bundle = %key.bundle_name,
            "template added"
        );
        Ok(())
    }

    /// Loads the template of `key` for `user`.
    pub fn get(&self, key: &SubscriberKey, user: i32) -> ShareResult<Template> {
        load_template(&self.meta, key, user)
    }

    /// Removes the template of `key` and stops its schedule.
    pub fn delete(&self, key: &SubscriberKey, user: i32) -> ShareResult<()> {
        self.meta.del_meta(&key.template_key(user), true).inspect_err(|err| {
            error!(uri = %anonymous::change(&key.uri), error = %err, "failed to delete template");
        })?;
        self.scheduler.remove_timer(key);
        Ok(())
    }
}

impl std::fmt::Debug for TemplateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateManager").finish_non_exhaustive()
    }
}
