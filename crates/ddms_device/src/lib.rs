//! # DDMS Device
//!
//! Single source of truth for which devices are reachable and what their
//! stable identifiers are.
//!
//! This crate provides:
//! - [`DeviceRegistry`]: presence tracking, identifier resolution and
//!   tiered change notification
//! - [`DeviceTransport`]: the platform device manager collaborator, with a
//!   programmable [`MockDeviceTransport`]
//! - [`DeviceChangeListener`]: observers grouped by [`ChangeLevel`]
//!
//! Network ids are ephemeral; uuid and udid are stable. The registry
//! indexes every online device under all three so any of them resolves to
//! the same [`DeviceInfo`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod info;
mod listener;
mod registry;
mod transport;

pub use error::{DeviceError, DeviceResult};
pub use info::{
    AuthType, DeviceChangeType, DeviceInfo, DmDeviceInfo, CLOUD_DEVICE_UDID, CLOUD_DEVICE_UUID,
    CLOUD_NETWORK_ID, OH_OS_TYPE,
};
pub use listener::{ChangeLevel, DeviceChangeListener, WatchId};
pub use registry::{DeviceRegistry, RegistryConfig, PKG_NAME};
pub use transport::{
    DeviceStateCallback, DeviceTransport, MockDeviceTransport, NetworkCallback,
    NOTIFY_EVENT_ON_DEVICE_READY,
};
