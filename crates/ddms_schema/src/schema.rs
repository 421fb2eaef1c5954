//! The relational schema object and its textual form.

use crate::error::{SchemaError, SchemaResult};
use crate::field::FieldInfo;
use crate::table::{CompareResult, TableInfo};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Schema versions this engine understands.
pub const SCHEMA_VERSIONS: [&str; 2] = ["2.0", "2.1"];
/// The only schema type a relational store accepts.
pub const SCHEMA_TYPE_RELATIVE: &str = "RELATIVE";
/// Longest schema text accepted.
pub const SCHEMA_STRING_SIZE_LIMIT: usize = 1024 * 1024;

const KEY_VERSION: &str = "SCHEMA_VERSION";
const KEY_TYPE: &str = "SCHEMA_TYPE";
const KEY_TABLES: &str = "TABLES";
const KEY_NAME: &str = "NAME";
const KEY_DEFINE: &str = "DEFINE";
const KEY_COLUMN_ID: &str = "COLUMN_ID";
const KEY_FIELD_TYPE: &str = "TYPE";
const KEY_NOT_NULL: &str = "NOT_NULL";
const KEY_DEFAULT: &str = "DEFAULT";
const KEY_AUTOINCREMENT: &str = "AUTOINCREMENT";
const KEY_UNIQUE: &str = "UNIQUE";
const KEY_PRIMARY_KEY: &str = "PRIMARY_KEY";
const KEY_INDEX: &str = "INDEX";
const KEY_TABLE_ID: &str = "TABLE_ID";

/// Kind of schema a store declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    /// Schemaless store.
    None,
    /// JSON document schema.
    Json,
    /// Flatbuffer schema.
    FlatBuffer,
    /// Relational tables.
    Relative,
}

/// A parsed relational schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationalSchemaObject {
    version: String,
    tables: BTreeMap<String, TableInfo>,
}

impl RelationalSchemaObject {
    /// Creates an empty schema at the newest version.
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSIONS[SCHEMA_VERSIONS.len() - 1].to_string(),
            tables: BTreeMap::new(),
        }
    }

    /// Parses schema text.
    ///
    /// Oversized input fails with [`SchemaError::InvalidArgs`], malformed
    /// JSON with [`SchemaError::JsonParseFail`] and anything else that is
    /// not a relational schema with [`SchemaError::SchemaParseFail`].
    pub fn parse_from_schema_string(text: &str) -> SchemaResult<Self> {
        if text.is_empty() || text.len() > SCHEMA_STRING_SIZE_LIMIT {
            return Err(SchemaError::InvalidArgs(format!(
                "schema length {} out of range",
                text.len()
            )));
        }
        let root: Value = serde_json::from_str(text)
            .map_err(|err| SchemaError::JsonParseFail(err.to_string()))?;
        let root = root
            .as_object()
            .ok_or_else(|| SchemaError::parse("schema root is not an object"))?;

        let version = root
            .get(KEY_VERSION)
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::parse("missing SCHEMA_VERSION"))?;
        if !SCHEMA_VERSIONS.contains(&version) {
            return Err(SchemaError::parse(format!("unsupported version {version}")));
        }
        let schema_type = root
            .get(KEY_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::parse("missing SCHEMA_TYPE"))?;
        if schema_type != SCHEMA_TYPE_RELATIVE {
            return Err(SchemaError::parse(format!("unsupported type {schema_type}")));
        }
        let tables = root
            .get(KEY_TABLES)
            .and_then(Value::as_array)
            .ok_or_else(|| SchemaError::parse("TABLES must be an array"))?;
        if tables.is_empty() {
            return Err(SchemaError::parse("no table defined"));
        }

        let mut schema = Self {
            version: version.to_string(),
            tables: BTreeMap::new(),
        };
        for table in tables {
            let table = parse_table(table, version)?;
            schema.tables.insert(table.name.clone(), table);
        }
        Ok(schema)
    }

    /// Emits the canonical text form.
    pub fn to_schema_string(&self) -> String {
        let tables: Vec<Value> = self.tables.values().map(table_to_json).collect();
        json!({
            KEY_VERSION: self.version,
            KEY_TYPE: SCHEMA_TYPE_RELATIVE,
            KEY_TABLES: tables,
        })
        .to_string()
    }

    /// Schema version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Adds or replaces a table.
    pub fn add_table(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Looks a table up by name.
    pub fn get_table(&self, name: &str) -> SchemaResult<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| SchemaError::TableNotFound(name.to_string()))
    }

    /// All tables keyed by name.
    pub fn tables(&self) -> &BTreeMap<String, TableInfo> {
        &self.tables
    }

    /// Table names in order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Compares every table with the peer's schema.
    ///
    /// Tables known to only one side are reported incompatible.
    pub fn compare_with_schema(&self, other: &RelationalSchemaObject) -> BTreeMap<String, CompareResult> {
        let mut outcome = BTreeMap::new();
        for (name, table) in &self.tables {
            let result = other
                .tables
                .get(name)
                .map_or(CompareResult::Incompatible, |theirs| table.compare_with_table(theirs));
            outcome.insert(name.clone(), result);
        }
        for name in other.tables.keys() {
            outcome
                .entry(name.clone())
                .or_insert(CompareResult::Incompatible);
        }
        outcome
    }
}

fn parse_table(value: &Value, version: &str) -> SchemaResult<TableInfo> {
    let object = value
        .as_object()
        .ok_or_else(|| SchemaError::parse("table is not an object"))?;
    let name = object
        .get(KEY_NAME)
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SchemaError::parse("table without NAME"))?;
    let mut table = TableInfo::new(name);

    let define = object
        .get(KEY_DEFINE)
        .and_then(Value::as_object)
        .ok_or_else(|| SchemaError::parse(format!("table {name} without DEFINE")))?;
    if define.is_empty() {
        return Err(SchemaError::parse(format!("table {name} has no field")));
    }
    for (field_name, field) in define {
        table.add_field(parse_field(field_name, field)?);
    }

    if let Some(primary) = object.get(KEY_PRIMARY_KEY) {
        table.primary_key = match primary {
            Value::String(column) => vec![column.clone()],
            Value::Array(columns) if version != SCHEMA_VERSIONS[0] => string_list(columns)
                .ok_or_else(|| SchemaError::parse("PRIMARY_KEY must list strings"))?,
            _ => return Err(SchemaError::parse("PRIMARY_KEY must be a string")),
        };
    }
    if let Some(auto_increment) = object.get(KEY_AUTOINCREMENT) {
        table.auto_increment = auto_increment
            .as_bool()
            .ok_or_else(|| SchemaError::parse("AUTOINCREMENT must be a bool"))?;
    }
    if let Some(unique) = object.get(KEY_UNIQUE) {
        let unique = unique
            .as_array()
            .ok_or_else(|| SchemaError::parse("UNIQUE must be an array"))?;
        for define in unique {
            let columns = match define {
                Value::String(column) => vec![column.clone()],
                Value::Array(columns) => string_list(columns)
                    .ok_or_else(|| SchemaError::parse("UNIQUE must list strings"))?,
                _ => return Err(SchemaError::parse("UNIQUE entry must be a string or array")),
            };
            table.unique_defines.push(columns);
        }
    }
    if let Some(indexes) = object.get(KEY_INDEX) {
        let indexes = indexes
            .as_object()
            .ok_or_else(|| SchemaError::parse("INDEX must be an object"))?;
        for (index, columns) in indexes {
            let columns = columns
                .as_array()
                .and_then(|columns| string_list(columns))
                .ok_or_else(|| SchemaError::parse(format!("index {index} must list strings")))?;
            table.add_index_define(index.clone(), columns);
        }
    }
    if let Some(table_id) = object.get(KEY_TABLE_ID) {
        table.table_id = table_id
            .as_i64()
            .ok_or_else(|| SchemaError::parse("TABLE_ID must be an integer"))?;
    }
    Ok(table)
}

fn parse_field(name: &str, value: &Value) -> SchemaResult<FieldInfo> {
    let object = value
        .as_object()
        .ok_or_else(|| SchemaError::parse(format!("field {name} is not an object")))?;
    let data_type = object
        .get(KEY_FIELD_TYPE)
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::parse(format!("field {name} without TYPE")))?;
    let mut field = FieldInfo::new(name, data_type);
    if let Some(column_id) = object.get(KEY_COLUMN_ID) {
        field.column_id = column_id
            .as_i64()
            .ok_or_else(|| SchemaError::parse(format!("field {name} COLUMN_ID must be an integer")))?;
    }
    if let Some(not_null) = object.get(KEY_NOT_NULL) {
        field.not_null = not_null
            .as_bool()
            .ok_or_else(|| SchemaError::parse(format!("field {name} NOT_NULL must be a bool")))?;
    }
    if let Some(default) = object.get(KEY_DEFAULT) {
        let default = default
            .as_str()
            .ok_or_else(|| SchemaError::parse(format!("field {name} DEFAULT must be a string")))?;
        field.has_default = true;
        field.default_value = default.to_string();
    }
    Ok(field)
}

fn string_list(values: &[Value]) -> Option<Vec<String>> {
    values
        .iter()
        .map(|value| value.as_str().map(str::to_string))
        .collect()
}

fn table_to_json(table: &TableInfo) -> Value {
    let mut define = Map::new();
    for field in table.ordered_fields() {
        let mut object = Map::new();
        object.insert(KEY_COLUMN_ID.into(), json!(field.column_id));
        object.insert(KEY_FIELD_TYPE.into(), json!(field.data_type));
        object.insert(KEY_NOT_NULL.into(), json!(field.not_null));
        if field.has_default {
            object.insert(KEY_DEFAULT.into(), json!(field.default_value));
        }
        define.insert(field.name.clone(), Value::Object(object));
    }

    let mut object = Map::new();
    object.insert(KEY_NAME.into(), json!(table.name));
    object.insert(KEY_DEFINE.into(), Value::Object(define));
    object.insert(KEY_TABLE_ID.into(), json!(table.table_id));
    if table.auto_increment {
        object.insert(KEY_AUTOINCREMENT.into(), json!(true));
    }
    match table.primary_key.as_slice() {
        [] => {}
        [single] => {
            object.insert(KEY_PRIMARY_KEY.into(), json!(single));
        }
        columns => {
            object.insert(KEY_PRIMARY_KEY.into(), json!(columns));
        }
    }
    if !table.unique_defines.is_empty() {
        object.insert(KEY_UNIQUE.into(), json!(table.unique_defines));
    }
    if !table.indexes.is_empty() {
        object.insert(KEY_INDEX.into(), json!(table.indexes));
    }
    Value::Object(object)
}
