//! # DDMS Store
//!
//! The two [`GeneralStore`](ddms_core::GeneralStore) implementations of
//! DDMS and the engine seams they sit on.
//!
//! This crate provides:
//! - [`KvGeneralStore`]: KV stores with key-rewriting interceptors for
//!   peers that scope keys by device
//! - [`RdbGeneralStore`]: relational stores with distributed tables and
//!   remote queries
//! - [`KvEngine`] and [`RelationalEngine`]: the sync engine collaborators,
//!   with in-memory implementations for tests
//! - Creators wiring both stores into an [`AutoCache`](ddms_core::AutoCache)
//!
//! Engine statuses are mapped onto [`GeneralError`](ddms_core::GeneralError)
//! at the store boundary; nothing engine-specific leaks to callers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod creator;
mod engine;
mod error;
mod identifier;
mod kv_store;
mod memory;
mod observer;
mod progress;
mod rdb_store;

pub use context::StoreContext;
pub use creator::{kv_creator, rdb_creator, register_creators};
pub use engine::{
    BriefCallback, ClearMode, CloudSyncConfig, CloudSyncOption, ConflictPolicy, DeviceStatuses,
    EngineChange, EngineObserver, EngineOrigin, EngineStoreId, InterceptedData, Interceptor,
    KvEngine, KvOpenOptions, KvSyncDelegate, ProcessCallback, RdbOpenOptions, RelationalDelegate,
    RelationalEngine, SecurityFlag, SecurityOption, SyncProcess, TableBriefCallback,
    TableProcess, TableStatus, TableStatuses, TransferInfo,
};
pub use error::{convert_status, EngineError, EngineResult};
pub use identifier::{
    kv_store_identifier, rewrite_key, scoped_key, split_scoped_key, DEFAULT_ACCOUNT_ID,
};
pub use kv_store::{open_options, security_option, KvGeneralStore, META_COMPRESS_RATE};
pub use memory::{
    EngineCall, MemoryKvEngine, MemoryKvSyncDelegate, MemoryRelationalDelegate,
    MemoryRelationalEngine,
};
pub use progress::to_details;
pub use rdb_store::RdbGeneralStore;
