//! Presence properties of the device registry.

use ddms_core::{ExecutorConfig, ExecutorPool};
use ddms_device::{
    ChangeLevel, DeviceChangeListener, DeviceChangeType, DeviceInfo, DeviceRegistry,
    DmDeviceInfo, MockDeviceTransport, RegistryConfig,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Tiered {
    level: ChangeLevel,
    log: Arc<Mutex<Vec<(ChangeLevel, DeviceChangeType)>>>,
}

impl DeviceChangeListener for Tiered {
    fn on_device_changed(&self, _info: &DeviceInfo, change: DeviceChangeType) {
        self.log.lock().push((self.level, change));
    }

    fn change_level(&self) -> ChangeLevel {
        self.level
    }
}

fn dm(network_id: &str) -> DmDeviceInfo {
    DmDeviceInfo {
        network_id: network_id.to_string(),
        ..DmDeviceInfo::default()
    }
}

fn level() -> impl Strategy<Value = ChangeLevel> {
    prop_oneof![
        Just(ChangeLevel::High),
        Just(ChangeLevel::Low),
        Just(ChangeLevel::Min)
    ]
}

proptest! {
    #[test]
    fn any_identifier_resolves_to_same_record(
        ids in prop::collection::hash_set("[a-z0-9]{4,12}", 1..8)
    ) {
        let transport = Arc::new(MockDeviceTransport::new());
        let registry = DeviceRegistry::new(transport.clone(), RegistryConfig::default());
        let ids: Vec<String> = ids.into_iter().collect();
        for id in &ids {
            transport.add_peer(&format!("net-{id}"), &format!("uuid-{id}"), &format!("udid-{id}"), false);
            registry.online(&dm(&format!("net-{id}")));
        }
        for id in &ids {
            let by_net = registry.get_device_info(&format!("net-{id}"));
            prop_assert!(by_net.is_resolved());
            prop_assert_eq!(&by_net, &registry.get_device_info(&format!("uuid-{id}")));
            prop_assert_eq!(&by_net, &registry.get_device_info(&format!("udid-{id}")));
        }
        for id in &ids {
            registry.offline(&dm(&format!("net-{id}")));
            transport.remove_peer(&format!("net-{id}"));
            for key in [format!("net-{id}"), format!("uuid-{id}"), format!("udid-{id}")] {
                prop_assert_eq!(registry.to_uuid(&key), "");
            }
        }
        prop_assert_eq!(registry.get_online_size(), 0);
    }

    #[test]
    fn online_tiers_never_interleave(levels in prop::collection::vec(level(), 0..12)) {
        let transport = Arc::new(MockDeviceTransport::new());
        transport.add_peer("net-a", "uuid-a", "udid-a", false);
        let registry = DeviceRegistry::new(transport, RegistryConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        for level in &levels {
            registry
                .start_watch_device_change(Some(Arc::new(Tiered { level: *level, log: log.clone() })))
                .unwrap();
        }
        registry.online(&dm("net-a"));

        let log = log.lock();
        let order: Vec<ChangeLevel> = log.iter().map(|(level, _)| *level).collect();
        let mut sorted = order.clone();
        sorted.sort();
        prop_assert_eq!(&order, &sorted);

        let highs = levels.iter().filter(|l| **l == ChangeLevel::High).count();
        prop_assert_eq!(log.len(), levels.len() + highs);
        for pair in log.chunks(2).take(highs) {
            prop_assert_eq!(pair[0].1, DeviceChangeType::Offline);
            prop_assert_eq!(pair[1].1, DeviceChangeType::Online);
        }
    }
}

#[test]
fn offline_and_ready_keep_order_per_device() {
    let transport = Arc::new(MockDeviceTransport::new());
    for i in 0..4 {
        transport.add_peer(&format!("net-{i}"), &format!("uuid-{i}"), &format!("udid-{i}"), false);
    }
    let registry = DeviceRegistry::new(transport, RegistryConfig::default());
    registry.init(Arc::new(ExecutorPool::new(&ExecutorConfig::new(2, 4)).unwrap()));

    let log = Arc::new(Mutex::new(Vec::new()));
    struct ByDevice(Arc<Mutex<Vec<(String, DeviceChangeType)>>>);
    impl DeviceChangeListener for ByDevice {
        fn on_device_changed(&self, info: &DeviceInfo, change: DeviceChangeType) {
            if change != DeviceChangeType::Online {
                self.0.lock().push((info.uuid.clone(), change));
            }
        }
    }
    registry
        .start_watch_device_change(Some(Arc::new(ByDevice(log.clone()))))
        .unwrap();

    for i in 0..4 {
        let net = format!("net-{i}");
        registry.online(&dm(&net));
        registry.on_ready(&dm(&net));
        registry.offline(&dm(&net));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().len() < 8 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let log = log.lock();
    assert_eq!(log.len(), 8);
    for i in 0..4 {
        let uuid = format!("uuid-{i}");
        let changes: Vec<DeviceChangeType> = log
            .iter()
            .filter(|(id, _)| *id == uuid)
            .map(|(_, change)| *change)
            .collect();
        assert_eq!(changes, vec![DeviceChangeType::Ready, DeviceChangeType::Offline]);
    }
}
