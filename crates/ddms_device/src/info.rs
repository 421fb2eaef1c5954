use serde::{Deserialize, Serialize};

/// Network id of the pseudo-device standing for the cloud.
pub const CLOUD_NETWORK_ID: &str = "cloudNetworkId";
/// Uuid of the cloud pseudo-device.
pub const CLOUD_DEVICE_UUID: &str = "cloudDeviceUuid";
/// Udid of the cloud pseudo-device.
pub const CLOUD_DEVICE_UDID: &str = "cloudDeviceUdid";
/// OS type reported by peers that already embed compatible identifiers.
pub const OH_OS_TYPE: i32 = 10;

/// Device as reported by the platform device manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DmDeviceInfo {
    /// Platform device id.
    pub device_id: String,
    /// Human readable name.
    pub device_name: String,
    /// Device type code.
    pub device_type_id: u16,
    /// Session network id.
    pub network_id: String,
}

impl DmDeviceInfo {
    /// The cloud pseudo-device.
    pub fn cloud() -> Self {
        Self {
            device_id: "cloudDeviceId".to_string(),
            device_name: "cloudDeviceName".to_string(),
            device_type_id: 0,
            network_id: CLOUD_NETWORK_ID.to_string(),
        }
    }
}

/// A resolved device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    /// Stable id shared with peers.
    pub uuid: String,
    /// Stable hardware id.
    pub udid: String,
    /// Session network id.
    pub network_id: String,
    /// Human readable name.
    pub device_name: String,
    /// Device type code.
    pub device_type: u32,
}

impl DeviceInfo {
    /// Returns true if all three identifiers are known.
    pub fn is_resolved(&self) -> bool {
        !self.uuid.is_empty() && !self.udid.is_empty() && !self.network_id.is_empty()
    }
}

/// Kind of a device change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceChangeType {
    /// The device came online.
    Online,
    /// The device went offline.
    Offline,
    /// The device finished its post-online sync.
    Ready,
}

/// How a peer authenticated with this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
    /// No account on the peer.
    NoAccount,
    /// Same account on both devices.
    IdenticalAccount,
    /// Any other pairing.
    Other,
}
