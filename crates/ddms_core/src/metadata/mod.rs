//! Metadata records and the durable metadata manager.
//!
//! Every record is a serde struct stored as JSON under a `###`-separated
//! key. Records live in one of two planes: the synced plane is replicated
//! to trusted peers, the local plane never leaves the device.

mod cloud;
mod manager;
mod matrix;
mod store_meta;

pub use cloud::{
    AppInfo, CloudInfo, Database, Field, RelationMeta, SchemaMeta, Subscription, Table,
    EXPIRE_INTERVAL_MS,
};
pub use manager::{
    ChangeFlag, DelegateOpener, MetaConfig, MetaDataManager, MetaObserver, MetaPlane, ObserverId,
    RemoteChange, Syncer,
};
pub use matrix::MatrixMetaData;
pub use store_meta::{
    security_level, store_type, AutoLaunchMetaData, CapabilityRange, SecretKeyMetaData,
    StoreDebugInfo, StoreKind, StoreMetaData, StoreMetaDataLocal, StrategyMeta,
};

/// Separator between key fields.
pub const KEY_SEPARATOR: &str = "###";

/// Placeholder account segment kept for key compatibility with peers.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Joins `prefix` and `fields` with [`KEY_SEPARATOR`].
pub fn join_key(prefix: &str, fields: &[&str]) -> String {
    let mut key = String::from(prefix);
    for field in fields {
        key.push_str(KEY_SEPARATOR);
        key.push_str(field);
    }
    key
}
