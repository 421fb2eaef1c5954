//! # DDMS Cloud
//!
//! Cloud synchronization for DDMS stores.
//!
//! This crate provides:
//! - [`SyncManager`]: turns sync requests into per-database sync events,
//!   merges duplicate requests and tracks the last outcome per store
//! - [`Retryer`] and [`RetryPolicy`]: retry with backoff chosen by error kind
//! - [`CloudService`]: account switches, cleaning, schema download and
//!   change subscriptions
//! - [`CloudServer`]: the cloud provider collaborator, with a programmable
//!   [`MockCloudServer`]
//!
//! The manager must be bound to an [`ExecutorPool`](ddms_core::ExecutorPool)
//! before it accepts requests; the service is constructed first and bound
//! once the process's worker pool exists.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod event;
mod retry;
mod server;
mod service;
mod sync_info;
mod sync_manager;

pub use config::RetryPolicy;
pub use context::CloudContext;
pub use error::{CloudError, CloudResult};
pub use event::{CloudEvent, SyncEvent};
pub use retry::{RetryDecision, RetryScheduler, Retryer, SyncOutcome};
pub use server::{BundleDatabases, CloudServer, MockCloudServer, MOCK_SUBSCRIPTION_TTL};
pub use service::{AccountChange, CloudService, NET_UUID};
pub use sync_info::{compare, generate_id, SyncInfo, DEFAULT_ID};
pub use sync_manager::{LastSyncInfo, SyncManager, SyncStatus};
