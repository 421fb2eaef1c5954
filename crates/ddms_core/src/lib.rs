//! # DDMS Core
//!
//! Framework layer shared by every DDMS feature.
//!
//! This crate provides:
//! - The store/sync status taxonomy ([`GeneralError`], [`ErrorClass`])
//! - A bounded worker pool with delayed and cancellable tasks ([`ExecutorPool`])
//! - Typed in-process event topics with drop-to-unsubscribe guards ([`EventBus`])
//! - A map with per-key compute semantics ([`ConcurrentMap`])
//! - Metadata records and the durable two-plane [`MetaDataManager`]
//! - The [`GeneralStore`] contract and the per-(token, store) [`AutoCache`]
//! - Collaborator seams for accounts and telemetry
//!
//! Everything here is constructed explicitly and passed around as `Arc`
//! handles; there are no process-wide singletons.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod anonymous;
mod concurrent_map;
pub mod dfx;
mod error;
mod event;
mod executor;
pub mod metadata;
mod ref_count;
pub mod store;
mod value;

pub use concurrent_map::ConcurrentMap;
pub use error::{ErrorClass, GeneralError, MetaError, MetaResult, StoreResult};
pub use event::{EventBus, EventGuard};
pub use executor::{ExecutorConfig, ExecutorPool, TaskId, INVALID_TASK_ID};
pub use metadata::{ChangeFlag, DelegateOpener, MetaConfig, MetaDataManager, MetaPlane, ObserverId};
pub use ref_count::RefCounter;
pub use store::{AutoCache, CacheConfig, GeneralStore};
pub use value::{Asset, VBucket, VBuckets, Value};

/// Crate version, reported by the daemon at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
