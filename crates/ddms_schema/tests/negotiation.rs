//! Properties of schema comparison and negotiation.

use ddms_schema::{
    CompareResult, FieldInfo, RelationalSchemaObject, RelationalSyncOpinion,
    RelationalSyncStrategy, SyncOpinion, TableInfo,
};
use proptest::prelude::*;

fn field() -> impl Strategy<Value = FieldInfo> {
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

fn table() -> impl Strategy<Value = TableInfo> {
    (
        "[A-Z][A-Z0-9_]{0,8}",
        prop::collection::vec(field(), 1..6),
        any::<bool>(),
        prop::collection::btree_map("idx_[a-z]{1,4}", prop::collection::vec("[a-z]{1,6}", 1..3), 0..3),
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
            table.indexes = indexes;
            table
        })
}

fn schema() -> impl Strategy<Value = RelationalSchemaObject> {
    prop::collection::vec(table(), 1..4).prop_map(|tables| {
        let mut schema = RelationalSchemaObject::new();
        for table in tables {
            schema.add_table(table);
        }
        schema
    })
}

fn opinions() -> impl Strategy<Value = RelationalSyncOpinion> {
    prop::collection::btree_map(
        "t[0-9]",
        (any::<bool>(), any::<bool>(), any::<bool>()),
        0..8,
    )
    .prop_map(|entries| {
        let mut opinion = RelationalSyncOpinion::new();
        for (table, (permit, convert, check)) in entries {
            opinion.add_sync_opinion(table, SyncOpinion::new(permit, convert, check));
        }
        opinion
    })
}

proptest! {
    #[test]
    fn compare_is_reflexive(table in table()) {
        prop_assert_eq!(table.compare_with_table(&table), CompareResult::Equal);
    }

    #[test]
    fn schema_text_reparses_equal(schema in schema()) {
        let text = schema.to_schema_string();
        let again = RelationalSchemaObject::parse_from_schema_string(&text).unwrap();
        prop_assert_eq!(again.table_names(), schema.table_names());
        for result in schema.compare_with_schema(&again).values() {
            prop_assert_eq!(*result, CompareResult::Equal);
        }
    }

    #[test]
    fn optional_column_is_an_upgrade(table in table(), extra in "zz[a-z]{1,4}") {
        let mut newer = table.clone();
        newer.add_field(FieldInfo::new(extra, "TEXT"));
        prop_assert_eq!(table.compare_with_table(&newer), CompareResult::CompatibleUpgrade);
    }

    #[test]
    fn negotiation_agrees_from_both_sides(a in opinions(), b in opinions()) {
        let ab = RelationalSyncStrategy::conclude(&a, &b);
        let ba = RelationalSyncStrategy::conclude(&b, &a);
        let keys_ab: Vec<&String> = ab.strategies().keys().collect();
        let keys_ba: Vec<&String> = ba.strategies().keys().collect();
        prop_assert_eq!(keys_ab, keys_ba);
        prop_assert_eq!(ab.permitted_tables(), ba.permitted_tables());
        for (table, strategy) in ab.strategies() {
            let mirrored = ba.get_table_strategy(table);
            prop_assert_eq!(strategy.convert_on_send, mirrored.convert_on_receive);
            prop_assert!(a.opinions().contains_key(table) && b.opinions().contains_key(table));
        }
    }
}
