use super::{join_key, DEFAULT_ACCOUNT};
use crate::anonymous;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store type codes.
pub mod store_type {
    /// KV store reconciling concurrent writes per device.
    pub const DEVICE_COLLABORATION: i32 = 0;
    /// KV store with last-writer-wins semantics.
    pub const SINGLE_VERSION: i32 = 1;
    /// Legacy multi-version KV store.
    pub const MULTI_VERSION: i32 = 2;
    /// First KV code.
    pub const KV_BEGIN: i32 = 0;
    /// Last KV code.
    pub const KV_END: i32 = 9;
    /// First relational code.
    pub const RELATIONAL_BEGIN: i32 = 10;
    /// Relational store.
    pub const RELATIONAL: i32 = 10;
    /// Last relational code.
    pub const RELATIONAL_END: i32 = 19;
}

/// Security level codes.
pub mod security_level {
    /// No label set.
    pub const NO_LABEL: i32 = 0;
    /// Public data.
    pub const S0: i32 = 1;
    /// Low sensitivity.
    pub const S1: i32 = 2;
    /// Medium sensitivity.
    pub const S2: i32 = 3;
    /// High sensitivity, extended.
    pub const S3_EX: i32 = 4;
    /// High sensitivity.
    pub const S3: i32 = 5;
    /// Critical.
    pub const S4: i32 = 6;
}

/// Engine family derived from a store type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    /// Key-value engine.
    Kv,
    /// Relational engine.
    Relational,
    /// Anything else.
    Unknown,
}

/// Descriptor of one logical store instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreMetaData {
    /// Record layout version.
    pub version: u32,
    /// Sync automatically on local change.
    pub is_auto_sync: bool,
    /// Keep a backup copy of the database.
    pub is_backup: bool,
    /// The store was not closed cleanly.
    pub is_dirty: bool,
    /// The database file is encrypted.
    pub is_encrypt: bool,
    /// Remote data is only cleaned on request.
    pub is_manual_clean: bool,
    /// The store takes part in search indexing.
    pub is_searchable: bool,
    /// Values are compressed on disk.
    pub is_need_compress: bool,
    /// Cloud sync is enabled for the store.
    pub enable_cloud: bool,
    /// Cloud sync runs on local change.
    pub cloud_auto_sync: bool,
    /// Assets download after the row data.
    pub async_download_asset: bool,
    /// The store is shared with other applications.
    pub is_public: bool,
    /// High availability mode of the engine.
    pub ha_mode: i32,
    /// One of the [`store_type`] codes.
    pub store_type: i32,
    /// One of the [`security_level`] codes.
    pub security_level: i32,
    /// Encryption area of the data directory.
    pub area: i32,
    /// Owning process uid.
    pub uid: i32,
    /// Application clone index; 0 for the main instance.
    pub instance_id: i32,
    /// Access token of the owning application.
    pub token_id: u32,
    /// Application type.
    pub app_type: String,
    /// Application id.
    pub app_id: String,
    /// Owning bundle.
    pub bundle_name: String,
    /// Module that created the store.
    pub hap_name: String,
    /// Directory holding the database files.
    pub data_dir: String,
    /// Caller supplied sub-directory.
    pub custom_dir: String,
    /// Device that owns the record.
    pub device_id: String,
    /// Account the store belongs to.
    pub account: String,
    /// Schema text, if any.
    pub schema: String,
    /// Store name within the bundle.
    pub store_id: String,
    /// Owning user, as text.
    pub user: String,
}

impl StoreMetaData {
    /// Synced-plane key prefix.
    pub const KEY_PREFIX: &'static str = "KvStoreMetaData";
    /// Local-plane key prefix.
    pub const LOCAL_PREFIX: &'static str = "KvStoreMetaDataLocal";
    /// Debug info key prefix.
    pub const DEBUG_PREFIX: &'static str = "KvStoreMetaDataDebug";

    /// Creates a descriptor for `store_id` of `bundle_name` owned by `user`.
    pub fn new(
        device_id: impl Into<String>,
        user: impl Into<String>,
        bundle_name: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        let bundle_name = bundle_name.into();
        Self {
            device_id: device_id.into(),
            user: user.into(),
            app_id: bundle_name.clone(),
            bundle_name,
            store_id: store_id.into(),
            ..Self::default()
        }
    }

    /// Builds a key prefix from leading key fields, for prefix scans.
    pub fn prefix(fields: &[&str]) -> String {
        join_key(Self::KEY_PREFIX, fields)
    }

    /// Synced-plane key.
    pub fn key(&self) -> String {
        self.scoped_key(Self::KEY_PREFIX)
    }

    /// Local-plane key of [`StoreMetaDataLocal`].
    pub fn key_local(&self) -> String {
        self.scoped_key(Self::LOCAL_PREFIX)
    }

    /// Key of the store's secret key.
    pub fn secret_key(&self) -> String {
        SecretKeyMetaData::key(&self.secret_fields())
    }

    /// Key of the store's backup secret key.
    pub fn backup_secret_key(&self) -> String {
        SecretKeyMetaData::backup_key(&self.secret_fields())
    }

    /// Key of the store's clone secret key.
    pub fn clone_secret_key(&self) -> String {
        SecretKeyMetaData::clone_key(&self.secret_fields())
    }

    /// Key of the store's capability strategy.
    pub fn strategy_key(&self) -> String {
        self.scoped_key(StrategyMeta::PREFIX)
    }

    /// Key of the store's auto-launch record.
    pub fn auto_launch_key(&self) -> String {
        self.scoped_key(AutoLaunchMetaData::PREFIX)
    }

    /// Key of the store's debug info.
    pub fn debug_info_key(&self) -> String {
        self.scoped_key(Self::DEBUG_PREFIX)
    }

    /// Every key removed when the store is deleted, with its plane.
    ///
    /// The boolean is true for local-plane keys.
    pub fn related_keys(&self) -> Vec<(String, bool)> {
        vec![
            (self.key(), false),
            (self.key(), true),
            (self.key_local(), true),
            (self.secret_key(), true),
            (self.strategy_key(), false),
            (self.backup_secret_key(), true),
            (self.auto_launch_key(), true),
            (self.debug_info_key(), true),
            (self.clone_secret_key(), true),
        ]
    }

    /// Engine family of this store.
    pub fn store_kind(&self) -> StoreKind {
        match self.store_type {
            store_type::KV_BEGIN..=store_type::KV_END => StoreKind::Kv,
            store_type::RELATIONAL_BEGIN..=store_type::RELATIONAL_END => StoreKind::Relational,
            _ => StoreKind::Unknown,
        }
    }

    /// Store id masked for logging.
    pub fn store_alias(&self) -> String {
        anonymous::change(&self.store_id)
    }

    fn scoped_key(&self, prefix: &str) -> String {
        let instance = self.instance_id.to_string();
        let mut fields = vec![
            self.device_id.as_str(),
            self.user.as_str(),
            DEFAULT_ACCOUNT,
            self.bundle_name.as_str(),
            self.store_id.as_str(),
        ];
        if self.instance_id != 0 {
            fields.push(&instance);
        }
        join_key(prefix, &fields)
    }

    fn secret_fields(&self) -> [String; 5] {
        [
            self.user.clone(),
            DEFAULT_ACCOUNT.to_string(),
            self.bundle_name.clone(),
            self.store_id.clone(),
            self.instance_id.to_string(),
        ]
    }
}

/// Per-device part of a store descriptor, never synced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreMetaDataLocal {
    /// Sync automatically on local change.
    pub is_auto_sync: bool,
    /// Keep a backup copy of the database.
    pub is_backup: bool,
    /// The store was not closed cleanly.
    pub is_dirty: bool,
    /// The database file is encrypted.
    pub is_encrypt: bool,
    /// The store is shared with other applications.
    pub is_public: bool,
    /// Directory holding the database files.
    pub data_dir: String,
    /// Schema text, if any.
    pub schema: String,
    /// Callers granted temporary access.
    pub promise_info: Vec<String>,
}

/// Wrapped encryption key of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretKeyMetaData {
    /// Creation time of the key.
    pub time: Vec<u8>,
    /// Wrapped key bytes.
    pub s_key: Vec<u8>,
    /// Type of the owning store.
    pub store_type: i32,
    /// Encryption area.
    pub area: i32,
}

impl SecretKeyMetaData {
    const PREFIX: &'static str = "SecretKey";
    const BACKUP_PREFIX: &'static str = "BackupSecretKey";
    const CLONE_PREFIX: &'static str = "CloneSecretKey";
    const SINGLE_KEY: &'static str = "SINGLE_KEY";

    fn key(fields: &[String]) -> String {
        Self::with_suffix(Self::PREFIX, fields)
    }

    fn backup_key(fields: &[String]) -> String {
        Self::with_suffix(Self::BACKUP_PREFIX, fields)
    }

    fn clone_key(fields: &[String]) -> String {
        Self::with_suffix(Self::CLONE_PREFIX, fields)
    }

    fn with_suffix(prefix: &str, fields: &[String]) -> String {
        let mut parts: Vec<&str> = fields.iter().map(String::as_str).collect();
        parts.push(Self::SINGLE_KEY);
        join_key(prefix, &parts)
    }
}

/// Label range used to match capability between peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityRange {
    /// Labels this device accepts.
    pub local_label: Vec<String>,
    /// Labels expected from the peer.
    pub remote_label: Vec<String>,
}

/// Capability strategy of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyMeta {
    /// Owning device.
    pub dev_id: String,
    /// Owning user.
    pub user_id: String,
    /// Application clone index.
    pub instance_id: i32,
    /// Owning bundle.
    pub bundle_name: String,
    /// Store name.
    pub store_id: String,
    /// Whether capability matching applies.
    pub capability_enabled: bool,
    /// Labels used for matching.
    pub capability_range: CapabilityRange,
}

impl StrategyMeta {
    const PREFIX: &'static str = "StrategyMetaData";
}

/// Stores that must be opened when a peer connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoLaunchMetaData {
    /// Store id to the tables watched for auto launch.
    pub datas: BTreeMap<String, Vec<String>>,
    /// Launch even when only clean-up is pending.
    pub launch_for_clean_data: bool,
}

impl AutoLaunchMetaData {
    const PREFIX: &'static str = "AutoLaunch";
}

/// File statistics captured for diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreDebugInfo {
    /// File name to size in bytes.
    pub file_sizes: BTreeMap<String, u64>,
}
