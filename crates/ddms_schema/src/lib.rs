//! # DDMS Schema
//!
//! Decides, per table, whether two peers may synchronize it without
//! assuming both run the same schema version.
//!
//! This crate provides:
//! - [`RelationalSchemaObject`]: parse and emit the versioned schema text
//! - [`TableInfo::compare_with_table`]: EQUAL / COMPATIBLE /
//!   COMPATIBLE_UPGRADE / INCOMPATIBLE
//! - [`RelationalSyncOpinion`] and [`RelationalSyncStrategy`]: per-table
//!   opinions exchanged between peers and the strategy both agree on
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod field;
mod opinion;
mod schema;
mod table;

pub use error::{SchemaError, SchemaResult};
pub use field::FieldInfo;
pub use opinion::{RelationalSyncOpinion, RelationalSyncStrategy, SyncOpinion, SyncStrategy};
pub use schema::{
    RelationalSchemaObject, SchemaType, SCHEMA_STRING_SIZE_LIMIT, SCHEMA_TYPE_RELATIVE,
    SCHEMA_VERSIONS,
};
pub use table::{CompareResult, TableInfo};
