//! The uniform store contract shared by the KV and relational engines.

mod auto_cache;
mod cloud_db;
mod general_store;
mod progress;
pub mod sync_mode;
mod watcher;

pub use auto_cache::{AutoCache, CacheConfig, Creator};
pub use cloud_db::{AssetLoader, BindInfo, CloudConfig, CloudDb};
pub use general_store::{CleanMode, GenQuery, GeneralStore, StoreInfo, SyncParam, TableKind};
pub use progress::{
    DetailAsync, GenDetails, Progress, ProgressDetail, Statistic, TableDetail,
};
pub use watcher::{ChangeInfo, Origin, TableChange, Watcher};
