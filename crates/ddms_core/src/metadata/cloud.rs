//! Cloud account, schema and subscription records.

use super::join_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Subscriptions expiring within this window are renewed.
pub const EXPIRE_INTERVAL_MS: u64 = 2 * 24 * 60 * 60 * 1000;

/// Per-bundle cloud settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppInfo {
    /// Bundle name.
    pub bundle_name: String,
    /// Application id assigned by the cloud.
    pub app_id: String,
    /// Version of the cloud schema the bundle uses.
    pub version: u64,
    /// Application clone index.
    pub instance_id: i32,
    /// Whether the user turned cloud sync on for the bundle.
    pub cloud_switch: bool,
}

/// Cloud account state of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInfo {
    /// Local user id.
    pub user: i32,
    /// Hashed cloud account id; empty when logged out.
    pub id: String,
    /// Total cloud space in bytes.
    pub total_space: u64,
    /// Remaining cloud space in bytes.
    pub remain_space: u64,
    /// Master switch for cloud sync.
    pub enable_cloud: bool,
    /// Maximum records per sync batch.
    pub max_number: i32,
    /// Maximum bytes per sync batch.
    pub max_size: i32,
    /// Bundle name to settings, ordered by bundle name.
    pub apps: BTreeMap<String, AppInfo>,
}

impl CloudInfo {
    const PREFIX: &'static str = "CLOUD_INFO";
    const SCHEMA_PREFIX: &'static str = "CLOUD_SCHEMA";

    /// Creates an empty record for `user`.
    pub fn new(user: i32) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }

    /// Local-plane key of this record.
    pub fn key(&self) -> String {
        join_key(Self::PREFIX, &[&self.user.to_string()])
    }

    /// Returns true if an account id is present.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }

    /// Returns true if `bundle` is known to the cloud.
    pub fn exists(&self, bundle: &str) -> bool {
        self.apps.contains_key(bundle)
    }

    /// Returns true if the bundle switch is on.
    ///
    /// Sync additionally requires [`CloudInfo::enable_cloud`].
    pub fn is_on(&self, bundle: &str) -> bool {
        self.apps.get(bundle).is_some_and(|app| app.cloud_switch)
    }

    /// Returns true if cloud and the bundle switch are both on.
    pub fn can_sync(&self, bundle: &str) -> bool {
        self.enable_cloud && self.is_on(bundle)
    }

    /// Returns true if no bundle has its switch on.
    pub fn is_all_switch_off(&self) -> bool {
        !self.apps.values().any(|app| app.cloud_switch)
    }

    /// Key of the schema of `bundle`.
    pub fn schema_key(&self, bundle: &str, instance_id: i32) -> String {
        let user = self.user.to_string();
        if instance_id == 0 {
            join_key(Self::SCHEMA_PREFIX, &[&user, bundle])
        } else {
            join_key(Self::SCHEMA_PREFIX, &[&user, bundle, &instance_id.to_string()])
        }
    }

    /// Prefix of the schema keys of `bundle`, or of every bundle if empty.
    pub fn schema_prefix(&self, bundle: &str) -> String {
        let user = self.user.to_string();
        if bundle.is_empty() {
            join_key(Self::SCHEMA_PREFIX, &[&user, ""])
        } else {
            join_key(Self::SCHEMA_PREFIX, &[&user, bundle])
        }
    }

    /// Schema key of every known bundle.
    pub fn schema_keys(&self) -> BTreeMap<String, String> {
        self.apps
            .values()
            .map(|app| {
                (
                    app.bundle_name.clone(),
                    self.schema_key(&app.bundle_name, app.instance_id),
                )
            })
            .collect()
    }
}

/// A column of a cloud table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Field {
    /// Local column name.
    pub col_name: String,
    /// Cloud column name.
    pub alias: String,
    /// Value type tag, see [`crate::Value::type_tag`].
    #[serde(rename = "type")]
    pub data_type: i32,
    /// Part of the primary key.
    pub primary: bool,
    /// Accepts null.
    pub nullable: bool,
}

/// A table of a cloud database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Table {
    /// Local table name.
    pub name: String,
    /// Cloud table name.
    pub alias: String,
    /// Table columns.
    pub fields: Vec<Field>,
    /// Name of the table shared with other accounts.
    pub shared_table_name: String,
}

/// A cloud database of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Database {
    /// Local store name.
    pub name: String,
    /// Cloud database name.
    pub alias: String,
    /// Tables to sync.
    pub tables: Vec<Table>,
    /// Owning user.
    pub user: String,
    /// Owning device.
    pub device_id: String,
    /// Owning bundle.
    pub bundle_name: String,
}

impl Database {
    /// Local names of every table.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Cloud schema of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaMeta {
    /// Schema version.
    pub version: i32,
    /// Owning bundle.
    pub bundle_name: String,
    /// Databases of the bundle.
    pub databases: Vec<Database>,
}

impl SchemaMeta {
    /// Returns the database named `name`.
    pub fn get_database(&self, name: &str) -> Option<&Database> {
        self.databases.iter().find(|db| db.name == name)
    }

    /// Returns true if the schema describes at least one database.
    pub fn is_valid(&self) -> bool {
        !self.bundle_name.is_empty() && !self.databases.is_empty()
    }
}

/// Cloud change subscriptions of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subscription {
    /// Local user id.
    pub user_id: i32,
    /// Cloud account id the subscriptions belong to.
    pub id: String,
    /// Bundle name to expiry time, milliseconds since the epoch.
    pub expires_time: BTreeMap<String, u64>,
}

impl Subscription {
    const PREFIX: &'static str = "CLOUD_SUBSCRIPTION";
    const RELATION_PREFIX: &'static str = "CLOUD_RELATION";

    /// Creates an empty record for `user`.
    pub fn new(user: i32, id: impl Into<String>) -> Self {
        Self {
            user_id: user,
            id: id.into(),
            expires_time: BTreeMap::new(),
        }
    }

    /// Local-plane key of this record.
    pub fn key(&self) -> String {
        join_key(Self::PREFIX, &[&self.user_id.to_string()])
    }

    /// Key of the relation record of `bundle`.
    pub fn relation_key(&self, bundle: &str) -> String {
        join_key(Self::RELATION_PREFIX, &[&self.user_id.to_string(), bundle])
    }

    /// Earliest expiry over every bundle, or 0 if none.
    pub fn min_expire_time(&self) -> u64 {
        self.expires_time.values().copied().min().unwrap_or(0)
    }

    /// Returns true if `bundle` has no live subscription at `now_ms`.
    pub fn is_expired(&self, bundle: &str, now_ms: u64) -> bool {
        self.expires_time
            .get(bundle)
            .map_or(true, |expires| *expires <= now_ms)
    }
}

/// Mapping from cloud database alias to subscription id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationMeta {
    /// Cloud account id.
    pub id: String,
    /// Owning bundle.
    pub bundle_name: String,
    /// Database alias to cloud subscription id.
    pub relations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> CloudInfo {
        let mut info = CloudInfo::new(100);
        info.id = "account".into();
        info.apps.insert(
            "com.a".into(),
            AppInfo {
                bundle_name: "com.a".into(),
                cloud_switch: true,
                ..AppInfo::default()
            },
        );
        info.apps.insert(
            "com.b".into(),
            AppInfo {
                bundle_name: "com.b".into(),
                instance_id: 1,
                ..AppInfo::default()
            },
        );
        info
    }

    #[test]
    fn sync_requires_both_switches() {
        let mut info = info();
        assert!(info.is_on("com.a"));
        assert!(!info.can_sync("com.a"));
        info.enable_cloud = true;
        assert!(info.can_sync("com.a"));
        assert!(!info.can_sync("com.b"));
        assert!(!info.can_sync("com.missing"));
    }

    #[test]
    fn cloud_keys() {
        let info = info();
        assert_eq!(info.key(), "CLOUD_INFO###100");
        assert_eq!(info.schema_key("com.a", 0), "CLOUD_SCHEMA###100###com.a");
        assert_eq!(info.schema_key("com.b", 1), "CLOUD_SCHEMA###100###com.b###1");
        assert_eq!(info.schema_prefix(""), "CLOUD_SCHEMA###100###");
        let keys = info.schema_keys();
        assert_eq!(keys["com.b"], "CLOUD_SCHEMA###100###com.b###1");
    }

    #[test]
    fn subscription_expiry() {
        let mut sub = Subscription::new(100, "account");
        assert_eq!(sub.key(), "CLOUD_SUBSCRIPTION###100");
        assert_eq!(sub.relation_key("com.a"), "CLOUD_RELATION###100###com.a");
        assert_eq!(sub.min_expire_time(), 0);
        sub.expires_time.insert("com.a".into(), 2_000);
        sub.expires_time.insert("com.b".into(), 1_000);
        assert_eq!(sub.min_expire_time(), 1_000);
        assert!(sub.is_expired("com.b", 1_000));
        assert!(!sub.is_expired("com.a", 1_000));
        assert!(sub.is_expired("com.c", 0));
    }

    #[test]
    fn field_type_uses_wire_name() {
        let field = Field {
            col_name: "id".into(),
            data_type: 1,
            ..Field::default()
        };
        let json = serde_json::to_string(&field).unwrap();
        assert!(json.contains("\"type\":1"));
        assert!(json.contains("\"colName\":\"id\""));
    }
}
