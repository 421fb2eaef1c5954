//! Sync identifiers and per-device key namespacing.

use crate::error::{EngineError, EngineResult};
use sha2::{Digest, Sha256};

/// Account id used for peers without an account.
pub const DEFAULT_ACCOUNT_ID: &str = "ohosAnonymousUid";

/// Width of the trailing prefix-length field of a device-scoped key.
pub const UUID_WIDTH: usize = std::mem::size_of::<u32>();

/// Identifier under which peers find a KV store.
///
/// Lower-case hex SHA-256 of `user-app-store`.
pub fn kv_store_identifier(user: &str, app_id: &str, store_id: &str) -> String {
    let digest = Sha256::digest(format!("{user}-{app_id}-{store_id}").as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Re-scopes a device-scoped key to `prefix`.
///
/// A device-scoped key is `[owner][user key][owner length as u32 LE]`.
/// The result carries `prefix` as its owner.
pub fn rewrite_key(key: &[u8], prefix: &str) -> EngineResult<Vec<u8>> {
    if key.len() < UUID_WIDTH {
        return Err(EngineError::invalid_args("key shorter than its length field"));
    }
    let (body, tail) = key.split_at(key.len() - UUID_WIDTH);
    let mut width = [0u8; UUID_WIDTH];
    width.copy_from_slice(tail);
    let owner_len = u32::from_le_bytes(width) as usize;
    if owner_len > body.len() {
        return Err(EngineError::invalid_args("owner length exceeds key"));
    }
    let prefix_len = u32::try_from(prefix.len())
        .map_err(|_| EngineError::invalid_args("prefix too long"))?;

    let mut out = Vec::with_capacity(prefix.len() + body.len() - owner_len + UUID_WIDTH);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&body[owner_len..]);
    out.extend_from_slice(&prefix_len.to_le_bytes());
    Ok(out)
}

/// Builds a device-scoped key, the inverse of [`split_scoped_key`].
pub fn scoped_key(owner: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(owner.len() + key.len() + UUID_WIDTH);
    out.extend_from_slice(owner.as_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(owner.len() as u32).to_le_bytes());
    out
}

/// Splits a device-scoped key into owner and user key.
pub fn split_scoped_key(key: &[u8]) -> Option<(&[u8], &[u8])> {
    let body_len = key.len().checked_sub(UUID_WIDTH)?;
    let mut width = [0u8; UUID_WIDTH];
    width.copy_from_slice(&key[body_len..]);
    let owner_len = u32::from_le_bytes(width) as usize;
    if owner_len > body_len {
        return None;
    }
    Some((&key[..owner_len], &key[owner_len..body_len]))
}
