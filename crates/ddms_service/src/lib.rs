//! # DDMS Service
//!
//! The `ddmsd` daemon and its composition root.
//!
//! This crate provides:
//! - [`ServiceConfig`]: JSON configuration aggregating every component's settings
//! - [`Services`]: builds the worker pool, metadata, device registry, store
//!   cache, cloud service and data share registries, wired by injection
//! - [`Collaborators`]: the platform seams, with standalone in-process defaults

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod services;

pub use config::{
    CacheSettings, ExecutorSettings, MetaSettings, RegistrySettings, RetrySettings,
    SchedulerSettings, ServiceConfig,
};
pub use error::{ServiceError, ServiceResult};
pub use services::{Collaborators, Services, PROCESS_LABEL};
