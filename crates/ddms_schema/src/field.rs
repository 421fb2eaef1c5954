//! Column definitions.

use serde::{Deserialize, Serialize};

/// One column of a relational table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Column name.
    pub name: String,
    /// Declared type, compared case-insensitively.
    pub data_type: String,
    /// NOT NULL constraint.
    pub not_null: bool,
    /// Whether a DEFAULT clause exists.
    pub has_default: bool,
    /// Text of the DEFAULT clause.
    pub default_value: String,
    /// Position in the table definition.
    pub column_id: i64,
    /// AUTOINCREMENT column.
    pub auto_increment: bool,
}

impl FieldInfo {
    /// Creates a nullable field without default.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ..Self::default()
        }
    }

    /// Marks the field NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Gives the field a default.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.has_default = true;
        self.default_value = value.into();
        self
    }

    /// Sets the column position.
    #[must_use]
    pub fn with_column_id(mut self, column_id: i64) -> Self {
        self.column_id = column_id;
        self
    }

    /// Returns true if both fields describe the same column.
    ///
    /// Column position and autoincrement do not take part.
    pub fn compare(&self, other: &FieldInfo) -> bool {
        self.name == other.name
            && self.data_type.eq_ignore_ascii_case(&other.data_type)
            && self.not_null == other.not_null
            && self.has_default == other.has_default
            && (!self.has_default || self.default_value == other.default_value)
    }

    /// Returns true if a peer without this column can still sync with us.
    pub fn is_optional(&self) -> bool {
        !self.not_null || self.has_default
    }
}
