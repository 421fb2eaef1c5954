//! Dynamic field values carried by relational rows and share templates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single row, keyed by column name.
pub type VBucket = BTreeMap<String, Value>;

/// A batch of rows.
pub type VBuckets = Vec<VBucket>;

/// A file attached to a row and synced separately from the row data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Asset {
    /// Asset version.
    pub version: u32,
    /// File name.
    pub name: String,
    /// Location in the cloud or on disk.
    pub uri: String,
    /// Creation time, milliseconds since the epoch.
    pub create_time: String,
    /// Modification time, milliseconds since the epoch.
    pub modify_time: String,
    /// File size in bytes, as text.
    pub size: String,
    /// Content hash.
    pub hash: String,
}

/// A dynamic column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Double precision float.
    Double(f64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// A single asset.
    Asset(Asset),
    /// A list of assets.
    Assets(Vec<Asset>),
}

impl Value {
    /// Field type tag as used in schema metadata.
    pub fn type_tag(&self) -> i32 {
        match self {
            Value::Null => 0,
            Value::Integer(_) => 1,
            Value::Double(_) => 2,
            Value::Text(_) => 3,
            Value::Bool(_) => 4,
            Value::Bytes(_) => 5,
            Value::Asset(_) => 6,
            Value::Assets(_) => 7,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns every asset held by this value.
    pub fn assets(&self) -> &[Asset] {
        match self {
            Value::Asset(asset) => std::slice::from_ref(asset),
            Value::Assets(assets) => assets,
            _ => &[],
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Asset> for Value {
    fn from(asset: Asset) -> Self {
        Value::Asset(asset)
    }
}
