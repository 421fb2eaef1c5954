use super::join_key;
use serde::{Deserialize, Serialize};

/// Change bitmap a device advertises to its peers.
///
/// Each bit marks a feature whose metadata changed since the peer last
/// synced; peers pull the matching metadata and clear the bit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatrixMetaData {
    /// Bitmap layout version.
    pub version: u32,
    /// Bits for data that changes at runtime.
    pub dynamic: u16,
    /// Bits for data fixed at install time.
    pub statics: u16,
    /// Device the bitmap describes.
    pub device_id: String,
    /// Whether the record was written locally or received.
    pub origin: i32,
}

impl MatrixMetaData {
    const PREFIX: &'static str = "MatrixMeta";

    /// Key of the bitmap of `device_id`.
    pub fn key_of(device_id: &str) -> String {
        join_key(Self::PREFIX, &[device_id])
    }

    /// Key of this record.
    pub fn key(&self) -> String {
        Self::key_of(&self.device_id)
    }
}
