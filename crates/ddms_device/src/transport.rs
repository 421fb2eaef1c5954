//! Platform device manager collaborator.

use crate::error::{DeviceError, DeviceResult};
use crate::info::{AuthType, DmDeviceInfo, OH_OS_TYPE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event id announcing that a device finished its post-online sync.
pub const NOTIFY_EVENT_ON_DEVICE_READY: i32 = 100;

/// Presence callbacks delivered by the platform.
pub trait DeviceStateCallback: Send + Sync {
    /// A trusted device came online.
    fn on_device_online(&self, info: &DmDeviceInfo);
    /// A trusted device went offline.
    fn on_device_offline(&self, info: &DmDeviceInfo);
    /// Device attributes changed.
    fn on_device_changed(&self, info: &DmDeviceInfo);
    /// A device finished its post-online sync.
    fn on_device_ready(&self, info: &DmDeviceInfo);
}

/// Connectivity callbacks delivered by the platform.
pub trait NetworkCallback: Send + Sync {
    /// A default network became available.
    fn on_available(&self);
    /// The default network was lost.
    fn on_lost(&self);
    /// No network can be brought up.
    fn on_unavailable(&self);
}

/// The platform's device discovery and authentication service.
///
/// The registry only consumes this interface; wire level discovery lives
/// behind it.
pub trait DeviceTransport: Send + Sync {
    /// Connects to the device manager.
    fn init_device_manager(&self, pkg_name: &str) -> DeviceResult<()>;

    /// Subscribes to presence callbacks.
    fn register_dev_state_callback(
        &self,
        pkg_name: &str,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> DeviceResult<()>;

    /// Subscribes to connectivity callbacks.
    fn register_network_callback(&self, callback: Arc<dyn NetworkCallback>) -> DeviceResult<()>;

    /// This device.
    fn get_local_device_info(&self, pkg_name: &str) -> DeviceResult<DmDeviceInfo>;

    /// Trusted peers currently known to the platform.
    fn get_trusted_device_list(&self, pkg_name: &str) -> DeviceResult<Vec<DmDeviceInfo>>;

    /// Resolves a network id to a uuid.
    fn get_uuid_by_network_id(&self, pkg_name: &str, network_id: &str) -> DeviceResult<String>;

    /// Resolves a network id to a udid.
    fn get_udid_by_network_id(&self, pkg_name: &str, network_id: &str) -> DeviceResult<String>;

    /// Derives the uuid an application sees for a device.
    fn generate_encrypted_uuid(&self, pkg_name: &str, uuid: &str, app_id: &str) -> DeviceResult<String>;

    /// Encrypted uuid of the device behind `network_id`.
    fn get_encrypted_uuid_by_network_id(&self, pkg_name: &str, network_id: &str) -> DeviceResult<String>;

    /// How the peer behind `network_id` authenticated.
    fn get_auth_type(&self, network_id: &str) -> AuthType;

    /// Returns true if the peer is logged into the same account.
    fn is_same_account(&self, network_id: &str) -> bool;

    /// OS type code of the peer.
    fn get_device_os_type(&self, network_id: &str) -> i32;

    /// Sends an event to the device manager.
    fn notify_event(&self, pkg_name: &str, event_id: i32, event: &str) -> DeviceResult<()>;

    /// Returns true if a default network is up.
    fn default_net_available(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
struct MockPeer {
    info: DmDeviceInfo,
    uuid: String,
    udid: String,
    auth: Option<AuthType>,
    os_type: i32,
}

/// A device manager for testing.
///
/// Peers and failures are programmed through setters; presence callbacks
/// can be fired with [`MockDeviceTransport::fire_online`] and friends.
#[derive(Default)]
pub struct MockDeviceTransport {
    init_failures: Mutex<u32>,
    local: RwLock<Option<MockPeer>>,
    peers: RwLock<HashMap<String, MockPeer>>,
    trusted: RwLock<Vec<String>>,
    net_available: AtomicBool,
    state_callbacks: Mutex<Vec<Arc<dyn DeviceStateCallback>>>,
    network_callbacks: Mutex<Vec<Arc<dyn NetworkCallback>>>,
    events: Mutex<Vec<(i32, String)>>,
    init_attempts: Mutex<u32>,
}

impl MockDeviceTransport {
    /// Creates a transport with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` init calls fail.
    pub fn fail_init_times(&self, count: u32) {
        *self.init_failures.lock() = count;
    }

    /// Number of init calls made so far.
    pub fn init_attempts(&self) -> u32 {
        *self.init_attempts.lock()
    }

    /// Sets the local device.
    pub fn set_local(&self, network_id: &str, uuid: &str, udid: &str) {
        let peer = MockPeer {
            info: dm_info(network_id),
            uuid: uuid.to_string(),
            udid: udid.to_string(),
            ..MockPeer::default()
        };
        self.peers.write().insert(network_id.to_string(), peer.clone());
        *self.local.write() = Some(peer);
    }

    /// Adds a peer resolvable by network id; `trusted` adds it to the trusted list.
    pub fn add_peer(&self, network_id: &str, uuid: &str, udid: &str, trusted: bool) {
        let peer = MockPeer {
            info: dm_info(network_id),
            uuid: uuid.to_string(),
            udid: udid.to_string(),
            ..MockPeer::default()
        };
        self.peers.write().insert(network_id.to_string(), peer);
        if trusted {
            self.trusted.write().push(network_id.to_string());
        }
    }

    /// Forgets a peer.
    pub fn remove_peer(&self, network_id: &str) {
        self.peers.write().remove(network_id);
        self.trusted.write().retain(|id| id != network_id);
    }

    /// Sets how a peer authenticated.
    pub fn set_auth_type(&self, network_id: &str, auth: AuthType) {
        if let Some(peer) = self.peers.write().get_mut(network_id) {
            peer.auth = Some(auth);
        }
    }

    /// Marks a peer as running an OS that embeds compatible identifiers.
    pub fn set_compatible(&self, network_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(network_id) {
            peer.os_type = OH_OS_TYPE;
        }
    }

    /// Sets the default network state.
    pub fn set_net_available(&self, available: bool) {
        self.net_available.store(available, Ordering::SeqCst);
    }

    /// Events sent through [`DeviceTransport::notify_event`].
    pub fn events(&self) -> Vec<(i32, String)> {
        self.events.lock().clone()
    }

    /// Fires the online callback for a known peer.
    pub fn fire_online(&self, network_id: &str) {
        let info = dm_info(network_id);
        for cb in self.state_callbacks.lock().clone() {
            cb.on_device_online(&info);
        }
    }

    /// Fires the offline callback for a peer.
    pub fn fire_offline(&self, network_id: &str) {
        let info = dm_info(network_id);
        for cb in self.state_callbacks.lock().clone() {
            cb.on_device_offline(&info);
        }
    }

    /// Fires the ready callback for a peer.
    pub fn fire_ready(&self, network_id: &str) {
        let info = dm_info(network_id);
        for cb in self.state_callbacks.lock().clone() {
            cb.on_device_ready(&info);
        }
    }

    /// Fires the network lost callback.
    pub fn fire_network_lost(&self) {
        for cb in self.network_callbacks.lock().clone() {
            cb.on_lost();
        }
    }

    /// Fires the network available callback.
    pub fn fire_network_available(&self) {
        for cb in self.network_callbacks.lock().clone() {
            cb.on_available();
        }
    }

    fn peer(&self, network_id: &str) -> Option<MockPeer> {
        self.peers.read().get(network_id).cloned()
    }
}

fn dm_info(network_id: &str) -> DmDeviceInfo {
    DmDeviceInfo {
        device_id: format!("dm-{network_id}"),
        device_name: format!("device {network_id}"),
        device_type_id: 0x0E,
        network_id: network_id.to_string(),
    }
}

impl DeviceTransport for MockDeviceTransport {
    fn init_device_manager(&self, _pkg_name: &str) -> DeviceResult<()> {
        *self.init_attempts.lock() += 1;
        let mut failures = self.init_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(DeviceError::NotReady);
        }
        Ok(())
    }

    fn register_dev_state_callback(
        &self,
        _pkg_name: &str,
        callback: Arc<dyn DeviceStateCallback>,
    ) -> DeviceResult<()> {
        self.state_callbacks.lock().push(callback);
        Ok(())
    }

    fn register_network_callback(&self, callback: Arc<dyn NetworkCallback>) -> DeviceResult<()> {
        self.network_callbacks.lock().push(callback);
        Ok(())
    }

    fn get_local_device_info(&self, _pkg_name: &str) -> DeviceResult<DmDeviceInfo> {
        self.local
            .read()
            .as_ref()
            .map(|peer| peer.info.clone())
            .ok_or(DeviceError::NotReady)
    }

    fn get_trusted_device_list(&self, _pkg_name: &str) -> DeviceResult<Vec<DmDeviceInfo>> {
        Ok(self.trusted.read().iter().map(|id| dm_info(id)).collect())
    }

    fn get_uuid_by_network_id(&self, _pkg_name: &str, network_id: &str) -> DeviceResult<String> {
        self.peer(network_id)
            .map(|p| p.uuid)
            .ok_or_else(|| DeviceError::transport(-1, "unknown network id"))
    }

    fn get_udid_by_network_id(&self, _pkg_name: &str, network_id: &str) -> DeviceResult<String> {
        self.peer(network_id)
            .map(|p| p.udid)
            .ok_or_else(|| DeviceError::transport(-1, "unknown network id"))
    }

    fn generate_encrypted_uuid(&self, _pkg_name: &str, uuid: &str, app_id: &str) -> DeviceResult<String> {
        Ok(format!("{app_id}:{uuid}"))
    }

    fn get_encrypted_uuid_by_network_id(&self, _pkg_name: &str, network_id: &str) -> DeviceResult<String> {
        self.peer(network_id)
            .map(|p| format!("enc-{}", p.uuid))
            .ok_or_else(|| DeviceError::transport(-1, "unknown network id"))
    }

    fn get_auth_type(&self, network_id: &str) -> AuthType {
        self.peer(network_id)
            .and_then(|p| p.auth)
            .unwrap_or(AuthType::IdenticalAccount)
    }

    fn is_same_account(&self, network_id: &str) -> bool {
        self.get_auth_type(network_id) == AuthType::IdenticalAccount
    }

    fn get_device_os_type(&self, network_id: &str) -> i32 {
        self.peer(network_id).map_or(0, |p| p.os_type)
    }

    fn notify_event(&self, _pkg_name: &str, event_id: i32, event: &str) -> DeviceResult<()> {
        self.events.lock().push((event_id, event.to_string()));
        Ok(())
    }

    fn default_net_available(&self) -> bool {
        self.net_available.load(Ordering::SeqCst)
    }
}
