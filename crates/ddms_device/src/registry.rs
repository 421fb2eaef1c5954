//! The device registry.

use crate::error::{DeviceError, DeviceResult};
use crate::info::{
    AuthType, DeviceChangeType, DeviceInfo, DmDeviceInfo, CLOUD_DEVICE_UDID, CLOUD_DEVICE_UUID,
    CLOUD_NETWORK_ID, OH_OS_TYPE,
};
use crate::listener::{ChangeLevel, DeviceChangeListener, WatchId};
use crate::transport::{
    DeviceStateCallback, DeviceTransport, NetworkCallback, NOTIFY_EVENT_ON_DEVICE_READY,
};
use ddms_core::{anonymous, ConcurrentMap, ExecutorPool};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Package name presented to the platform device manager.
pub const PKG_NAME: &str = "ddms.service";

/// Device registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Delay between device manager registration attempts.
    pub init_retry_interval: Duration,
    /// How long an online device may stay pending before READY is forced.
    pub sync_timeout: Duration,
    /// How long a negative network answer is trusted.
    pub net_effective_duration: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            init_retry_interval: Duration::from_millis(500),
            sync_timeout: Duration::from_secs(10),
            net_effective_duration: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    /// Sets the registration retry interval.
    #[must_use]
    pub fn with_init_retry_interval(mut self, interval: Duration) -> Self {
        self.init_retry_interval = interval;
        self
    }

    /// Sets the ready timeout.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets how long a network answer stays valid.
    #[must_use]
    pub fn with_net_effective_duration(mut self, duration: Duration) -> Self {
        self.net_effective_duration = duration;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Online,
    Ready,
}

#[derive(Debug)]
struct NetState {
    available: bool,
    expire: Instant,
}

#[derive(Default)]
struct DispatchQueue {
    events: VecDeque<(DeviceInfo, DeviceChangeType)>,
    draining: bool,
}

/// Tracks reachable devices and resolves their identifiers.
///
/// Every online device is cached under its network id, uuid and udid, so
/// any of the three resolves to the same [`DeviceInfo`]. Resolution
/// failures are logged and swallowed: device churn is routine.
///
/// Online notifications run on the caller's thread in three tiers
/// ([`ChangeLevel::High`], then `Low`, then `Min`). Offline and ready
/// notifications go through a single FIFO queue drained on the executor,
/// so events for one device are never reordered.
pub struct DeviceRegistry {
    transport: Arc<dyn DeviceTransport>,
    config: RegistryConfig,
    self_ref: Weak<DeviceRegistry>,
    executor: RwLock<Option<Arc<ExecutorPool>>>,
    initialized: AtomicBool,
    listeners: RwLock<BTreeMap<WatchId, Arc<dyn DeviceChangeListener>>>,
    next_watch: AtomicU64,
    device_infos: RwLock<HashMap<String, DeviceInfo>>,
    local: RwLock<DeviceInfo>,
    ready_devices: ConcurrentMap<String, (ReadyState, DeviceInfo)>,
    pending: Mutex<HashSet<String>>,
    net: Mutex<NetState>,
    dispatch: Mutex<DispatchQueue>,
}

impl DeviceRegistry {
    /// Creates a registry over a platform transport.
    pub fn new(transport: Arc<dyn DeviceTransport>, config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            config,
            self_ref: self_ref.clone(),
            executor: RwLock::new(None),
            initialized: AtomicBool::new(false),
            listeners: RwLock::new(BTreeMap::new()),
            next_watch: AtomicU64::new(1),
            device_infos: RwLock::new(HashMap::new()),
            local: RwLock::new(DeviceInfo::default()),
            ready_devices: ConcurrentMap::new(),
            pending: Mutex::new(HashSet::new()),
            net: Mutex::new(NetState {
                available: false,
                expire: Instant::now(),
            }),
            dispatch: Mutex::new(DispatchQueue::default()),
        })
    }

    /// Registers with the platform device manager.
    ///
    /// A failed attempt is retried every `init_retry_interval` until it
    /// succeeds. On success the device cache is warmed from the trusted
    /// device list.
    pub fn init(&self, executor: Arc<ExecutorPool>) {
        *self.executor.write() = Some(executor);
        self.try_register();
    }

    /// Returns true once registration succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn try_register(&self) {
        match self.register() {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.init_device_info(false);
                info!("device manager registered");
            }
            Err(err) => {
                warn!(error = %err, "device manager registration failed, retrying");
                let Some(executor) = self.executor() else {
                    return;
                };
                let weak = self.self_ref.clone();
                executor.schedule(self.config.init_retry_interval, move || {
                    if let Some(registry) = weak.upgrade() {
                        registry.try_register();
                    }
                });
            }
        }
    }

    fn register(&self) -> DeviceResult<()> {
        self.transport.init_device_manager(PKG_NAME)?;
        let bridge = Arc::new(CallbackBridge(self.self_ref.clone()));
        self.transport
            .register_dev_state_callback(PKG_NAME, bridge.clone())?;
        self.transport.register_network_callback(bridge)?;
        Ok(())
    }

    fn executor(&self) -> Option<Arc<ExecutorPool>> {
        self.executor.read().clone()
    }

    /// Adds a presence listener.
    pub fn start_watch_device_change(
        &self,
        listener: Option<Arc<dyn DeviceChangeListener>>,
    ) -> DeviceResult<WatchId> {
        let listener =
            listener.ok_or_else(|| DeviceError::InvalidArgument("null listener".into()))?;
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, listener);
        debug!(watch = id.0, "device listener added");
        Ok(id)
    }

    /// Removes a presence listener.
    pub fn stop_watch_device_change(&self, id: WatchId) -> DeviceResult<()> {
        self.listeners
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::UnknownListener)
    }

    fn listeners(&self) -> Vec<Arc<dyn DeviceChangeListener>> {
        self.listeners.read().values().cloned().collect()
    }

    /// Handles a device coming online.
    pub fn online(&self, info: &DmDeviceInfo) {
        let Some(device) = self.resolve(info) else {
            warn!(
                network = %anonymous::change(&info.network_id),
                "online device could not be resolved"
            );
            return;
        };
        info!(
            uuid = %anonymous::change(&device.uuid),
            name = %device.device_name,
            "device online"
        );
        self.save_device_info(&device);
        self.ready_devices
            .insert(device.uuid.clone(), (ReadyState::Online, device.clone()));
        self.pending.lock().insert(device.uuid.clone());

        let listeners = self.listeners();
        for listener in listeners.iter().filter(|l| l.change_level() == ChangeLevel::High) {
            listener.on_device_changed(&device, DeviceChangeType::Offline);
            listener.on_device_changed(&device, DeviceChangeType::Online);
        }
        for listener in listeners.iter().filter(|l| l.change_level() == ChangeLevel::Low) {
            listener.on_device_changed(&device, DeviceChangeType::Online);
        }
        if let Some(executor) = self.executor() {
            let weak = self.self_ref.clone();
            let uuid = device.uuid.clone();
            executor.schedule(self.config.sync_timeout, move || {
                if let Some(registry) = weak.upgrade() {
                    registry.time_out(&uuid);
                }
            });
        }
        for listener in listeners.iter().filter(|l| l.change_level() == ChangeLevel::Min) {
            listener.on_device_changed(&device, DeviceChangeType::Online);
        }
    }

    /// Handles a device going offline.
    ///
    /// A device that no longer resolves is ignored.
    pub fn offline(&self, info: &DmDeviceInfo) {
        let Some(device) = self.resolve(info) else {
            debug!(
                network = %anonymous::change(&info.network_id),
                "offline device already gone"
            );
            return;
        };
        info!(uuid = %anonymous::change(&device.uuid), "device offline");
        self.pending.lock().remove(&device.uuid);
        {
            let mut infos = self.device_infos.write();
            infos.remove(&device.network_id);
            infos.remove(&device.uuid);
            infos.remove(&device.udid);
        }
        self.ready_devices.erase(&device.uuid);
        self.dispatch(device, DeviceChangeType::Offline);
    }

    /// Logs a device attribute change.
    pub fn on_changed(&self, info: &DmDeviceInfo) {
        debug!(
            network = %anonymous::change(&info.network_id),
            name = %info.device_name,
            "device changed"
        );
    }

    /// Handles a device finishing its post-online sync.
    pub fn on_ready(&self, info: &DmDeviceInfo) {
        let Some(device) = self.resolve(info) else {
            warn!(
                network = %anonymous::change(&info.network_id),
                "ready device could not be resolved"
            );
            return;
        };
        info!(uuid = %anonymous::change(&device.uuid), "device ready");
        self.pending.lock().remove(&device.uuid);
        self.ready_devices
            .insert(device.uuid.clone(), (ReadyState::Ready, device.clone()));
        self.dispatch(device, DeviceChangeType::Ready);
    }

    /// Fires the ready event for a device still pending after the timeout.
    pub fn time_out(&self, uuid: &str) {
        if uuid.is_empty() {
            return;
        }
        let was_pending = self.pending.lock().remove(uuid);
        if was_pending && uuid != CLOUD_DEVICE_UUID {
            debug!(uuid = %anonymous::change(uuid), "ready timeout");
            self.send_ready_event(uuid);
        }
    }

    /// Fires the ready event for a pending device ahead of the timeout.
    pub fn notify_ready_event(&self, uuid: &str) {
        if uuid.is_empty() {
            return;
        }
        if self.pending.lock().remove(uuid) {
            self.send_ready_event(uuid);
        }
    }

    fn send_ready_event(&self, uuid: &str) {
        let event = serde_json::json!({ "extra": { "deviceId": uuid } }).to_string();
        if let Err(err) = self
            .transport
            .notify_event(PKG_NAME, NOTIFY_EVENT_ON_DEVICE_READY, &event)
        {
            warn!(uuid = %anonymous::change(uuid), error = %err, "ready event not delivered");
        }
    }

    fn dispatch(&self, device: DeviceInfo, change: DeviceChangeType) {
        let Some(executor) = self.executor() else {
            for listener in self.listeners() {
                listener.on_device_changed(&device, change);
            }
            return;
        };
        {
            let mut queue = self.dispatch.lock();
            queue.events.push_back((device, change));
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        let weak = self.self_ref.clone();
        executor.execute(move || {
            if let Some(registry) = weak.upgrade() {
                registry.drain();
            }
        });
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut queue = self.dispatch.lock();
                let next = queue.events.pop_front();
                if next.is_none() {
                    queue.draining = false;
                }
                next
            };
            let Some((device, change)) = next else {
                return;
            };
            for listener in self.listeners() {
                listener.on_device_changed(&device, change);
            }
        }
    }

    fn resolve(&self, info: &DmDeviceInfo) -> Option<DeviceInfo> {
        let uuid = self.get_uuid_by_network_id(&info.network_id);
        let udid = self.get_udid_by_network_id(&info.network_id);
        let device = DeviceInfo {
            uuid,
            udid,
            network_id: info.network_id.clone(),
            device_name: info.device_name.clone(),
            device_type: u32::from(info.device_type_id),
        };
        device.is_resolved().then_some(device)
    }

    fn save_device_info(&self, device: &DeviceInfo) {
        let mut infos = self.device_infos.write();
        infos.insert(device.network_id.clone(), device.clone());
        infos.insert(device.uuid.clone(), device.clone());
        infos.insert(device.udid.clone(), device.clone());
    }

    fn get_device_info_from_cache(&self, id: &str) -> Option<DeviceInfo> {
        if let Some(found) = self.device_infos.read().get(id) {
            return Some(found.clone());
        }
        self.init_device_info(true);
        self.device_infos.read().get(id).cloned()
    }

    /// Resolves any identifier to the cached device.
    ///
    /// A miss rebuilds the cache from the platform once; a device that is
    /// still unknown comes back as `DeviceInfo::default()`.
    pub fn get_device_info(&self, id: &str) -> DeviceInfo {
        if id.is_empty() {
            return DeviceInfo::default();
        }
        self.get_device_info_from_cache(id).unwrap_or_default()
    }

    /// Refreshes the cache from the platform.
    ///
    /// Unless `only_cache` is set the online set is rebuilt too, with every
    /// trusted device marked ready.
    pub fn init_device_info(&self, only_cache: bool) {
        let remotes = self.get_remote_devices();
        if !only_cache {
            self.ready_devices.clear();
        }
        for device in remotes {
            if !device.is_resolved() {
                continue;
            }
            self.save_device_info(&device);
            if !only_cache {
                self.ready_devices
                    .insert(device.uuid.clone(), (ReadyState::Ready, device));
            }
        }
        let local = self.get_local_device();
        if local.is_resolved() {
            self.save_device_info(&local);
        }
    }

    /// This device. Memoized after the first full resolution.
    pub fn get_local_device(&self) -> DeviceInfo {
        {
            let local = self.local.read();
            if !local.uuid.is_empty() && !local.udid.is_empty() {
                return local.clone();
            }
        }
        let info = match self.transport.get_local_device_info(PKG_NAME) {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "local device unavailable");
                return DeviceInfo::default();
            }
        };
        let Some(device) = self.resolve(&info) else {
            warn!("local device could not be resolved");
            return DeviceInfo::default();
        };
        *self.local.write() = device.clone();
        device
    }

    /// Trusted peers reported by the platform, resolved.
    pub fn get_remote_devices(&self) -> Vec<DeviceInfo> {
        match self.transport.get_trusted_device_list(PKG_NAME) {
            Ok(list) => list.iter().filter_map(|info| self.resolve(info)).collect(),
            Err(err) => {
                warn!(error = %err, "trusted device list unavailable");
                Vec::new()
            }
        }
    }

    /// Devices currently online or ready.
    pub fn get_online_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        self.ready_devices.for_each_copies(|_, (_, info)| {
            devices.push(info.clone());
            false
        });
        devices
    }

    /// Returns true if the device finished its post-online sync.
    pub fn is_device_ready(&self, id: &str) -> bool {
        let uuid = self.to_uuid(id);
        matches!(
            self.ready_devices.get(&uuid),
            Some((ReadyState::Ready, _))
        )
    }

    /// Number of online devices.
    pub fn get_online_size(&self) -> usize {
        self.ready_devices.len()
    }

    /// Uuid of any known identifier, or "".
    pub fn to_uuid(&self, id: &str) -> String {
        self.get_device_info(id).uuid
    }

    /// Udid of any known identifier, or "".
    pub fn to_udid(&self, id: &str) -> String {
        self.get_device_info(id).udid
    }

    /// Network id of any known identifier, or "".
    pub fn to_network_id(&self, id: &str) -> String {
        self.get_device_info(id).network_id
    }

    /// Uuids of the given identifiers, skipping the unresolvable.
    pub fn to_uuid_list(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .map(|id| self.to_uuid(id))
            .filter(|uuid| !uuid.is_empty())
            .collect()
    }

    /// Uuid for a network id, or "".
    pub fn get_uuid_by_network_id(&self, network_id: &str) -> String {
        if network_id.is_empty() {
            return String::new();
        }
        if network_id == CLOUD_NETWORK_ID {
            return CLOUD_DEVICE_UUID.to_string();
        }
        if let Some(found) = self.device_infos.read().get(network_id) {
            return found.uuid.clone();
        }
        self.transport
            .get_uuid_by_network_id(PKG_NAME, network_id)
            .unwrap_or_else(|err| {
                warn!(network = %anonymous::change(network_id), error = %err, "uuid lookup failed");
                String::new()
            })
    }

    /// Udid for a network id, or "".
    pub fn get_udid_by_network_id(&self, network_id: &str) -> String {
        if network_id.is_empty() {
            return String::new();
        }
        if network_id == CLOUD_NETWORK_ID {
            return CLOUD_DEVICE_UDID.to_string();
        }
        if let Some(found) = self.device_infos.read().get(network_id) {
            return found.udid.clone();
        }
        self.transport
            .get_udid_by_network_id(PKG_NAME, network_id)
            .unwrap_or_else(|err| {
                warn!(network = %anonymous::change(network_id), error = %err, "udid lookup failed");
                String::new()
            })
    }

    /// Uuid an application sees for a device, or "".
    pub fn calc_client_uuid(&self, app_id: &str, uuid: &str) -> String {
        if app_id.is_empty() || uuid.is_empty() {
            return String::new();
        }
        self.transport
            .generate_encrypted_uuid(PKG_NAME, uuid, app_id)
            .unwrap_or_else(|err| {
                warn!(uuid = %anonymous::change(uuid), error = %err, "client uuid failed");
                String::new()
            })
    }

    /// Encrypted uuid of the device behind `network_id`, or "".
    pub fn get_encrypted_uuid_by_network_id(&self, network_id: &str) -> String {
        if network_id.is_empty() {
            return String::new();
        }
        self.transport
            .get_encrypted_uuid_by_network_id(PKG_NAME, network_id)
            .unwrap_or_else(|err| {
                warn!(network = %anonymous::change(network_id), error = %err, "encrypted uuid failed");
                String::new()
            })
    }

    /// Returns true if the peer is logged into the same account.
    pub fn is_same_account(&self, network_id: &str) -> bool {
        !network_id.is_empty() && self.transport.is_same_account(network_id)
    }

    /// How the peer authenticated.
    pub fn get_auth_type(&self, network_id: &str) -> AuthType {
        self.transport.get_auth_type(network_id)
    }

    /// Returns true if the peer already embeds compatible identifiers.
    pub fn is_compatible_peer(&self, network_id: &str) -> bool {
        !network_id.is_empty() && self.transport.get_device_os_type(network_id) == OH_OS_TYPE
    }

    /// Returns true if a default network is up.
    ///
    /// A positive answer is trusted until contradicted; a negative one only
    /// for `net_effective_duration`, after which the platform is asked again.
    pub fn is_network_available(&self) -> bool {
        {
            let net = self.net.lock();
            if net.available || net.expire > Instant::now() {
                return net.available;
            }
        }
        let available = self.transport.default_net_available();
        self.set_net_available(available)
    }

    /// Records the network state and returns it.
    pub fn set_net_available(&self, available: bool) -> bool {
        let mut net = self.net.lock();
        net.available = available;
        net.expire = Instant::now() + self.config.net_effective_duration;
        available
    }

    /// The default network came up; the cloud comes online with it.
    pub fn on_network_available(&self) {
        info!("network available");
        self.set_net_available(true);
        self.online(&DmDeviceInfo::cloud());
    }

    /// The default network went away; the cloud goes offline with it.
    pub fn on_network_lost(&self) {
        info!("network lost");
        self.set_net_available(false);
        self.offline(&DmDeviceInfo::cloud());
    }

    /// No network could be brought up.
    pub fn on_network_unavailable(&self) {
        info!("network unavailable");
        self.set_net_available(false);
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("initialized", &self.is_initialized())
            .field("online", &self.get_online_size())
            .finish()
    }
}

struct CallbackBridge(Weak<DeviceRegistry>);

impl DeviceStateCallback for CallbackBridge {
    fn on_device_online(&self, info: &DmDeviceInfo) {
        if let Some(registry) = self.0.upgrade() {
            registry.online(info);
        }
    }

    fn on_device_offline(&self, info: &DmDeviceInfo) {
        if let Some(registry) = self.0.upgrade() {
            registry.offline(info);
        }
    }

    fn on_device_changed(&self, info: &DmDeviceInfo) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_changed(info);
        }
    }

    fn on_device_ready(&self, info: &DmDeviceInfo) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_ready(info);
        }
    }
}

impl NetworkCallback for CallbackBridge {
    fn on_available(&self) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_network_available();
        }
    }

    fn on_lost(&self) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_network_lost();
        }
    }

    fn on_unavailable(&self) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_network_unavailable();
        }
    }
}
