//! Sync mode codes.
//!
//! A mode packs the sync direction in the low 16 bits and the trigger
//! (manual or automatic) in the high bits.

/// Push local changes to peers.
pub const NEARBY_PUSH: i32 = 0;
/// Pull changes from peers.
pub const NEARBY_PULL: i32 = 1;
/// Push then pull.
pub const NEARBY_PULL_PUSH: i32 = 2;
/// Subscribe to a peer's changes.
pub const NEARBY_SUBSCRIBE_REMOTE: i32 = 3;
/// Cancel a subscription to a peer.
pub const NEARBY_UNSUBSCRIBE_REMOTE: i32 = 4;
/// First code past the nearby range.
pub const NEARBY_END: i32 = 5;
/// Cloud sync, newest write wins.
pub const CLOUD_TIME_FIRST: i32 = 6;
/// Cloud sync, local write wins.
pub const CLOUD_NATIVE_FIRST: i32 = 7;
/// Cloud sync, cloud write wins.
pub const CLOUD_CLOUD_FIRST: i32 = 8;
/// First code past the cloud range.
pub const CLOUD_END: i32 = 9;

/// Sync requested by the user.
pub const MANUAL_SYNC_MODE: i32 = 0x00000;
/// Sync triggered by a data change.
pub const AUTO_SYNC_MODE: i32 = 0x10000;

const SYNC_MASK: i32 = 0xFFFF;

/// Packs a direction and a trigger into one mode.
pub fn mix_mode(sync_mode: i32, high_mode: i32) -> i32 {
    sync_mode | high_mode
}

/// Direction part of `mode`.
pub fn sync_mode(mode: i32) -> i32 {
    mode & SYNC_MASK
}

/// Trigger part of `mode`.
pub fn high_mode(mode: i32) -> i32 {
    mode & !SYNC_MASK
}

/// Returns true for peer to peer directions.
pub fn is_nearby(mode: i32) -> bool {
    (NEARBY_PUSH..NEARBY_END).contains(&sync_mode(mode))
}

/// Returns true for cloud directions.
pub fn is_cloud(mode: i32) -> bool {
    let sync = sync_mode(mode);
    sync > NEARBY_END && sync < CLOUD_END
}

/// Returns true if `mode` was requested interactively.
pub fn is_priority(mode: i32) -> bool {
    high_mode(mode) == MANUAL_SYNC_MODE
}
