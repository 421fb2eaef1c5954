//! Error types for schema handling.

use ddms_core::GeneralError;
use thiserror::Error;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while parsing or negotiating schemas.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The input cannot be a schema at all (too long, empty).
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// The text is not well-formed JSON.
    #[error("json parse failed: {0}")]
    JsonParseFail(String),

    /// The JSON is well-formed but not a valid relational schema.
    #[error("schema parse failed: {0}")]
    SchemaParseFail(String),

    /// The named table is not part of the schema.
    #[error("table not found: {0}")]
    TableNotFound(String),
}

impl SchemaError {
    /// Creates a schema parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        SchemaError::SchemaParseFail(message.into())
    }
}

impl From<SchemaError> for GeneralError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::InvalidArgs(_) => GeneralError::InvalidArgs,
            SchemaError::JsonParseFail(_) | SchemaError::SchemaParseFail(_) => {
                GeneralError::SchemaIncompatible
            }
            SchemaError::TableNotFound(_) => GeneralError::NotSupport,
        }
    }
}
