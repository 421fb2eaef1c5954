//! # DDMS Share
//!
//! Subscriber registries for data shared between applications.
//!
//! This crate provides:
//! - [`RdbSubscriberManager`]: observers of template subscriptions, fed with
//!   the template's predicate results whenever the subscribed URI changes
//! - [`PublishedDataSubscriberManager`]: observers of published data items,
//!   one grouped payload per observer
//! - [`TemplateManager`]: templates persisted in the local metadata plane
//! - [`SchedulerManager`]: per-subscription timers driven by the store
//! - [`ObserverHandle`]: observers identified by a stable id that are pruned
//!   automatically when their process dies
//!
//! Stores are reached through the [`TemplateDataSource`] collaborator;
//! [`MemoryTemplateDataSource`] answers from programmable tables.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod observer;
mod published;
mod rdb;
mod scheduler;
mod source;
mod template;
pub mod uri;

pub use error::{ShareError, ShareResult};
pub use observer::{
    Caller, ObserverHandle, ObserverId, PublishedDataChangeNode, PublishedDataObserver,
    PublishedItem, PublishedValue, RdbChangeNode, RdbObserver, RecordingObserver,
};
pub use published::{PublishedDataKey, PublishedDataSubscriberManager, PublishedObserverNode};
pub use rdb::{RdbObserverNode, RdbSubscriberManager};
pub use scheduler::{ScheduleTarget, SchedulerConfig, SchedulerManager};
pub use source::{MemoryTemplateDataSource, SourceCall, TemplateDataSource};
pub use template::{PredicateTemplateNode, SubscriberKey, Template, TemplateManager};
