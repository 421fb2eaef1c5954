//! # DDMS Testkit
//!
//! Test utilities for DDMS.
//!
//! This crate provides:
//! - [`TestEnv`]: executor, metadata, device registry and in-memory
//!   engines wired together the way the daemon wires them
//! - Property-based test generators using proptest
//! - [`CloudHarness`]: a provisioned cloud account for end-to-end scenarios
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ddms_testkit::prelude::*;
//!
//! #[test]
//! fn notify_syncs_once() {
//!     let harness = CloudHarness::new();
//!     harness.provision(true, true);
//!     harness.service.notify_data_change(TEST_USER, TEST_ACCOUNT, TEST_BUNDLE).unwrap();
//!     assert!(wait_until(|| harness.cloud_syncs() == 1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenarios;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
