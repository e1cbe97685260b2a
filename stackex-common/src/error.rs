use std::time::Duration;

use thiserror::Error;

/// Raised when a record breaks the encode-time contract of the active schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("required field {field} is missing")]
    MissingField { field: String },
    #[error("field {field} expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field {field} is not part of the schema")]
    UnknownField { field: String },
    #[error("avro writer rejected the record: {0}")]
    Rejected(String),
}

/// Raised when a payload cannot be turned back into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
    #[error("malformed avro datum: {0}")]
    Malformed(String),
    #[error("{remaining} trailing bytes after the datum")]
    TrailingBytes { remaining: usize },
    #[error("field {field} does not match the active schema, found {found}")]
    SchemaMismatch { field: String, found: String },
}

/// Raised at startup when a schema descriptor cannot be turned into a usable schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("record {0} declares no fields")]
    NoFields(String),
    #[error("field name {0:?} is not a valid avro name")]
    InvalidName(String),
    #[error("field {0} is declared more than once")]
    DuplicateField(String),
    #[error("schema could not be parsed: {0}")]
    Parse(String),
}

/// A publish, store or append call that was rejected, unreachable or too slow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("message bus rejected the message: {0}")]
    Rejected(String),
    #[error("message bus is unavailable: {0}")]
    Unavailable(String),
    #[error("object store request failed: {0}")]
    Storage(String),
    #[error("warehouse request failed: {0}")]
    Warehouse(String),
    #[error("no completion within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timestamp {0} cannot be mapped to a calendar partition")]
pub struct InvalidTimestamp(pub i64);
