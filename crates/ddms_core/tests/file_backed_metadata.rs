//! Metadata manager over the journaled file delegate.

use ddms_core::metadata::{AppInfo, CloudInfo, StoreMetaData};
use ddms_core::{MetaConfig, MetaDataManager, MetaPlane};
use ddms_storage::{FileKvDelegate, KvDelegate, MemoryKvDelegate, StorageResult};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn open_manager(dir: &Path) -> MetaDataManager {
    let root: PathBuf = dir.to_path_buf();
    let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
        let sub = match plane {
            MetaPlane::Synced => root.join("synced"),
            MetaPlane::Local => root.join("local"),
        };
        std::fs::create_dir_all(&sub)?;
        Ok(Arc::new(FileKvDelegate::open(&sub)?) as Arc<dyn KvDelegate>)
    };
    MetaDataManager::new(Arc::new(opener), MetaConfig::default())
}

#[test]
fn records_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut info = CloudInfo::new(100);
    info.id = "account".into();
    info.enable_cloud = true;
    info.apps.insert(
        "com.example".into(),
        AppInfo {
            bundle_name: "com.example".into(),
            cloud_switch: true,
            ..AppInfo::default()
        },
    );

    {
        let manager = open_manager(dir.path());
        manager.save_meta(&info.key(), &info, false).unwrap();
        manager.save_meta("LOCAL###x", &42u32, true).unwrap();
        manager.reset();
    }

    let manager = open_manager(dir.path());
    let loaded: CloudInfo = manager.load_meta(&info.key(), false).unwrap();
    assert_eq!(loaded, info);
    assert!(loaded.can_sync("com.example"));
    assert_eq!(manager.load_meta::<u32>("LOCAL###x", true), Some(42));
    assert!(manager.load_meta::<u32>("LOCAL###x", false).is_none());
}

#[test]
fn store_deletion_is_durable() {
    let dir = TempDir::new().unwrap();
    let meta = StoreMetaData::new("dev", "100", "com.example", "notes");
    {
        let manager = open_manager(dir.path());
        manager.save_meta(&meta.key(), &meta, false).unwrap();
        manager.save_meta(&meta.secret_key(), &vec![1u8, 2, 3], true).unwrap();
        manager.delete_store_meta(&meta).unwrap();
        manager.reset();
    }
    let manager = open_manager(dir.path());
    assert!(manager.load_meta::<StoreMetaData>(&meta.key(), false).is_none());
    assert!(manager.load_meta::<Vec<u8>>(&meta.secret_key(), true).is_none());
    let prefix = StoreMetaData::prefix(&["dev", "100"]);
    assert_eq!(manager.load_meta_list::<StoreMetaData>(&prefix, false), Some(Vec::new()));
}

fn memory_manager() -> MetaDataManager {
    let synced: Arc<dyn KvDelegate> = Arc::new(MemoryKvDelegate::new());
    let local: Arc<dyn KvDelegate> = Arc::new(MemoryKvDelegate::new());
    let opener = move |plane: MetaPlane| -> StorageResult<Arc<dyn KvDelegate>> {
        Ok(match plane {
            MetaPlane::Synced => Arc::clone(&synced),
            MetaPlane::Local => Arc::clone(&local),
        })
    };
    MetaDataManager::new(Arc::new(opener), MetaConfig::default())
}

proptest! {
    #[test]
    fn saved_values_load_back_from_their_plane(
        entries in prop::collection::btree_map("[A-Z]{1,6}###[a-z0-9]{1,8}", any::<i64>(), 1..16),
        local in any::<bool>(),
    ) {
        let manager = memory_manager();
        for (key, value) in &entries {
            manager.save_meta(key, value, local).unwrap();
        }
        let mut loaded = BTreeMap::new();
        for key in entries.keys() {
            prop_assert!(manager.load_meta::<i64>(key, !local).is_none());
            loaded.insert(key.clone(), manager.load_meta::<i64>(key, local).unwrap());
        }
        prop_assert_eq!(&loaded, &entries);

        for key in entries.keys() {
            manager.del_meta(key, local).unwrap();
            manager.del_meta(key, local).unwrap();
            prop_assert!(manager.load_meta::<i64>(key, local).is_none());
        }
    }
}
