use crate::info::{DeviceChangeType, DeviceInfo};

/// Priority tier of a device change listener.
///
/// On every online event the registry notifies all `High` listeners, then
/// all `Low`, then all `Min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeLevel {
    /// Engines that drop stale connections; they see OFFLINE then ONLINE.
    High,
    /// Metadata and security level sync.
    Low,
    /// Compatibility identifiers and service metadata.
    Min,
}

/// Observer of device presence.
pub trait DeviceChangeListener: Send + Sync {
    /// Called for each change.
    fn on_device_changed(&self, info: &DeviceInfo, change: DeviceChangeType);

    /// Tier this listener runs in.
    fn change_level(&self) -> ChangeLevel {
        ChangeLevel::Low
    }
}

/// Handle returned by registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub(crate) u64);
