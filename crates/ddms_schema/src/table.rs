//! Table definitions and their comparison.

use crate::field::FieldInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing a local table with a peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareResult {
    /// Same fields and same indexes.
    Equal,
    /// Same fields; indexes or unique constraints differ.
    Compatible,
    /// The peer has extra columns we can live without.
    CompatibleUpgrade,
    /// The tables cannot sync.
    Incompatible,
}

impl CompareResult {
    /// Returns true if rows may flow between the two tables.
    pub fn permits_sync(self) -> bool {
        !matches!(self, CompareResult::Incompatible)
    }
}

/// A relational table as described by the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Columns keyed by name.
    pub fields: BTreeMap<String, FieldInfo>,
    /// Primary key columns in declaration order.
    pub primary_key: Vec<String>,
    /// Unique constraints, each a list of columns.
    pub unique_defines: Vec<Vec<String>>,
    /// Indexes keyed by name.
    pub indexes: BTreeMap<String, Vec<String>>,
    /// AUTOINCREMENT on the primary key.
    pub auto_increment: bool,
    /// Engine assigned table id.
    pub table_id: i64,
}

impl TableInfo {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds or replaces a column.
    pub fn add_field(&mut self, field: FieldInfo) {
        self.fields.insert(field.name.clone(), field);
    }

    /// Adds or replaces an index.
    pub fn add_index_define(&mut self, name: impl Into<String>, columns: Vec<String>) {
        self.indexes.insert(name.into(), columns);
    }

    /// Columns sorted by column id, then name.
    pub fn ordered_fields(&self) -> Vec<&FieldInfo> {
        let mut fields: Vec<&FieldInfo> = self.fields.values().collect();
        fields.sort_by(|a, b| a.column_id.cmp(&b.column_id).then_with(|| a.name.cmp(&b.name)));
        fields
    }

    /// Compares this table with the peer's version of it.
    ///
    /// Every local column must exist unchanged on the peer. Extra peer
    /// columns are tolerated when they are nullable or defaulted, which
    /// yields [`CompareResult::CompatibleUpgrade`].
    pub fn compare_with_table(&self, other: &TableInfo) -> CompareResult {
        if self.name != other.name || self.primary_key != other.primary_key {
            return CompareResult::Incompatible;
        }
        let fields = self.compare_fields(other);
        if fields != CompareResult::Equal {
            return fields;
        }
        if self.indexes == other.indexes && self.unique_defines == other.unique_defines {
            CompareResult::Equal
        } else {
            CompareResult::Compatible
        }
    }

    fn compare_fields(&self, other: &TableInfo) -> CompareResult {
        for (name, field) in &self.fields {
            match other.fields.get(name) {
                Some(theirs) if field.compare(theirs) => {}
                _ => return CompareResult::Incompatible,
            }
        }
        let mut extra = false;
        for (name, field) in &other.fields {
            if self.fields.contains_key(name) {
                continue;
            }
            if !field.is_optional() {
                return CompareResult::Incompatible;
            }
            extra = true;
        }
        if extra {
            CompareResult::CompatibleUpgrade
        } else {
            CompareResult::Equal
        }
    }
}
