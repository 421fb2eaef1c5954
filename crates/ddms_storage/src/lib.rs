//! # DDMS Storage
//!
//! Key-value delegates backing the DDMS metadata store.
//!
//! This crate is the lowest layer of the workspace. A delegate is an
//! **opaque ordered byte map**: it stores keys and values without
//! interpreting them. Record formats, planes (local vs. synced) and change
//! notification live one layer up in `ddms_core`.
//!
//! ## Design Principles
//!
//! - Delegates are shared (`Send + Sync`, `&self` methods) and lock internally
//! - One transaction at a time per delegate; reads see staged writes
//! - A closed delegate fails every call with [`StorageError::Closed`]
//!
//! ## Available Delegates
//!
//! - [`MemoryKvDelegate`] - For tests and ephemeral stores
//! - [`FileKvDelegate`] - Journaled persistent store with replay on open
//!
//! ## Example
//!
//! ```rust
//! use ddms_storage::{KvDelegate, MemoryKvDelegate};
//!
//! let delegate = MemoryKvDelegate::new();
//! delegate.put(b"meta###a", b"1").unwrap();
//! assert_eq!(delegate.get(b"meta###a").unwrap(), Some(b"1".to_vec()));
//! assert_eq!(delegate.keys_with_prefix(b"meta###").unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delegate;
mod error;
mod file;
mod memory;
mod transaction;

pub use delegate::{KvDelegate, KvEntry};
pub use error::{StorageError, StorageResult};
pub use file::{FileKvDelegate, JOURNAL_FILE_NAME};
pub use memory::MemoryKvDelegate;
