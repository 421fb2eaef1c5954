//! Property-based test generators using proptest.
//!
//! Provides strategies for the records the services exchange: schemas,
//! negotiation opinions, device identities, cloud accounts and
//! subscription keys.

use ddms_core::metadata::{AppInfo, CloudInfo, StoreMetaData};
use ddms_schema::{FieldInfo, RelationalSchemaObject, RelationalSyncOpinion, SyncOpinion, TableInfo};
use ddms_share::uri::DATA_PROXY_SCHEME;
use ddms_share::{PublishedDataKey, SubscriberKey};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating column definitions.
pub fn field_strategy() -> impl Strategy<Value = FieldInfo> {
    (
        "[a-y][a-z0-9_]{0,8}",
        prop_oneof![Just("INTEGER"), Just("TEXT"), Just("BLOB"), Just("REAL")],
        any::<bool>(),
        proptest::option::of("[a-z0-9]{0,4}"),
        0i64..64,
    )
        .prop_map(|(name, data_type, not_null, default, column_id)| {
            let mut field = FieldInfo::new(name, data_type).with_column_id(column_id);
            if not_null {
                field = field.not_null();
            }
            if let Some(default) = default {
                field = field.with_default(default);
            }
            field
        })
}

/// Strategy for generating well formed tables.
///
/// Every table has at least one column and its first column as primary key.
pub fn table_strategy() -> impl Strategy<Value = TableInfo> {
    (
        "[A-Z][A-Z0-9_]{0,8}",
        prop::collection::vec(field_strategy(), 1..6),
        any::<bool>(),
        prop::collection::btree_map(
            "idx_[a-z]{1,4}",
            prop::collection::vec("[a-z]{1,6}", 1..3),
            0..3,
        ),
    )
        .prop_map(|(name, fields, auto_increment, indexes)| {
            let mut table = TableInfo::new(name);
            for field in fields {
                table.add_field(field);
            }
            if let Some(first) = table.fields.keys().next().cloned() {
                table.primary_key = vec![first];
            }
            table.auto_increment = auto_increment;
            for (index, columns) in indexes {
                table.add_index_define(index, columns);
            }
            table
        })
}

/// Strategy for generating relational schemas of one to three tables.
pub fn schema_strategy() -> impl Strategy<Value = RelationalSchemaObject> {
    prop::collection::vec(table_strategy(), 1..4).prop_map(|tables| {
        let mut schema = RelationalSchemaObject::new();
        for table in tables {
            schema.add_table(table);
        }
        schema
    })
}

/// Strategy for generating per-table sync opinions over a small name space.
pub fn opinion_strategy() -> impl Strategy<Value = RelationalSyncOpinion> {
    prop::collection::btree_map("t[0-9]", (any::<bool>(), any::<bool>(), any::<bool>()), 0..8)
        .prop_map(|entries| {
            let mut opinion = RelationalSyncOpinion::new();
            for (table, (permit, convert, check)) in entries {
                opinion.add_sync_opinion(table, SyncOpinion::new(permit, convert, check));
            }
            opinion
        })
}

/// A peer as the device manager reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIds {
    /// Network id.
    pub network_id: String,
    /// Uuid.
    pub uuid: String,
    /// Udid.
    pub udid: String,
}

/// Strategy for generating distinct peers whose three ids never collide.
pub fn peers_strategy(max: usize) -> impl Strategy<Value = Vec<PeerIds>> {
    prop::collection::btree_set("[a-z0-9]{4,12}", 1..=max.max(1)).prop_map(|ids| {
        ids.into_iter()
            .map(|id| PeerIds {
                network_id: format!("net-{id}"),
                uuid: format!("uuid-{id}"),
                udid: format!("udid-{id}"),
            })
            .collect()
    })
}

/// Strategy for generating bundle names.
pub fn bundle_strategy() -> impl Strategy<Value = String> {
    "com\\.[a-z]{2,6}\\.[a-z]{2,8}"
}

/// Strategy for generating bundle to cloud switch maps.
pub fn switches_strategy() -> impl Strategy<Value = BTreeMap<String, bool>> {
    prop::collection::btree_map(bundle_strategy(), any::<bool>(), 0..5)
}

/// Strategy for generating the cloud account of `user` under `id`.
pub fn cloud_info_strategy(user: i32, id: &str) -> impl Strategy<Value = CloudInfo> {
    let id = id.to_string();
    (any::<bool>(), switches_strategy()).prop_map(move |(enable_cloud, switches)| {
        let mut info = CloudInfo::new(user);
        info.id = id.clone();
        info.enable_cloud = enable_cloud;
        for (bundle, on) in switches {
            let app = AppInfo {
                bundle_name: bundle.clone(),
                cloud_switch: on,
                ..AppInfo::default()
            };
            info.apps.insert(bundle, app);
        }
        info
    })
}

/// Strategy for generating store metadata on `device`.
pub fn store_meta_strategy(device: &str) -> impl Strategy<Value = StoreMetaData> {
    let device = device.to_string();
    (0i32..1000, bundle_strategy(), "[a-z][a-z0-9_]{0,10}").prop_map(move |(user, bundle, store)| {
        StoreMetaData::new(device.clone(), user.to_string(), bundle, store)
    })
}

/// Strategy for generating template subscriptions on proxy uris.
pub fn subscriber_key_strategy() -> impl Strategy<Value = SubscriberKey> {
    (bundle_strategy(), "[a-z]{1,8}", 0i64..1000).prop_map(|(bundle, path, subscriber)| {
        let uri = format!("{DATA_PROXY_SCHEME}{bundle}/{path}");
        SubscriberKey::new(uri, subscriber, bundle)
    })
}

/// Strategy for generating published data keys.
pub fn published_key_strategy() -> impl Strategy<Value = PublishedDataKey> {
    ("[a-z]{1,8}", bundle_strategy(), 0i64..1000)
        .prop_map(|(key, bundle, subscriber)| PublishedDataKey::new(key, bundle, subscriber))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;

    #[test]
    fn tables_are_well_formed() {
        let mut runner = TestRunner::default();
        runner
            .run(&table_strategy(), |table| {
                prop_assert!(!table.fields.is_empty());
                prop_assert_eq!(table.primary_key.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn peer_ids_are_distinct() {
        let mut runner = TestRunner::default();
        runner
            .run(&peers_strategy(6), |peers| {
                let mut all: Vec<&str> = peers
                    .iter()
                    .flat_map(|p| [p.network_id.as_str(), p.uuid.as_str(), p.udid.as_str()])
                    .collect();
                let total = all.len();
                all.sort_unstable();
                all.dedup();
                prop_assert_eq!(all.len(), total);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn subscriber_uris_are_proxy_uris() {
        let mut runner = TestRunner::default();
        runner
            .run(&subscriber_key_strategy(), |key| {
                prop_assert!(ddms_share::uri::is_data_proxy_uri(&key.uri));
                Ok(())
            })
            .unwrap();
    }
}
