//! Access to the HPS conditions database.
//!
//! The [`manager::DatabaseConditionsManager`] resolves, for a detector and run number, which
//! versioned calibration collection applies to each conditions key, loads it from SQLite into
//! typed collections and caches the result until the run changes.

use thiserror::Error;

/// Command-line interface of the `hps-conditions` binary.
pub mod cli;
/// XML configuration of the conditions manager.
pub mod config;
/// Connection parameters and retrying connection setup.
pub mod connection;
/// Conditions requests written as `key[:run[:tag]]`.
pub mod context;
/// Converters that turn conditions records into typed collections.
pub mod converter;
/// Field values, conditions objects and their collections.
pub mod data;
pub mod ecal;
/// The conditions manager.
pub mod manager;
/// Table metadata, conditions records and tags.
pub mod models;
pub mod query;
/// Table and converter registries.
pub mod registry;
pub mod setup;
pub mod svt;

pub use hps_core::{Id, RunNumber};

/// Convenience alias for results returned from conditions operations.
pub type ConditionsResult<T> = Result<T, ConditionsError>;

/// Errors that can occur while resolving, loading or writing conditions.
#[derive(Error, Debug)]
pub enum ConditionsError {
    /// Wrapper around rusqlite errors.
    #[error("{0}")]
    SqliteError(#[from] rusqlite::Error),
    /// Wrapper around filesystem errors.
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    /// The XML configuration could not be applied.
    #[error("{0}")]
    ConfigError(#[from] config::ConfigError),
    /// A request string was malformed.
    #[error("{0}")]
    ParseRequestError(#[from] context::ParseRequestError),
    /// A stored timestamp could not be parsed.
    #[error("{0}")]
    ParseTimestampError(#[from] hps_core::errors::ParseTimestampError),
    /// No table metadata is registered under the given key or table name.
    #[error("table meta data not found: {0}")]
    TableNotFound(String),
    /// No converter produces the requested conditions type.
    #[error("no converter registered for type {0}")]
    ConverterNotFound(String),
    /// A declared converter does not produce the collection type of its row type.
    #[error("converter for {row_type} produces {found} instead of {expected}")]
    InvalidConverter {
        /// The declared row type.
        row_type: &'static str,
        /// Collection type of the row type.
        expected: &'static str,
        /// Type the converter produces.
        found: &'static str,
    },
    /// Two distinct row types claim the same table.
    #[error("table {table} is claimed by both {first} and {second}")]
    DuplicateTableName {
        /// The contested table.
        table: String,
        /// Row type declared first.
        first: &'static str,
        /// Row type declared second.
        second: &'static str,
    },
    /// A row type was declared for more than one table.
    #[error("{object_type} is declared for both {first} and {second}")]
    DuplicateObjectType {
        /// The row type.
        object_type: &'static str,
        /// Table declared first.
        first: String,
        /// Table declared second.
        second: String,
    },
    /// No conditions record matched the key, run and tag.
    #[error("no conditions records found for key {key} at run {run}{}", tag_suffix(.tag))]
    NoConditionsRecords {
        /// Conditions key.
        key: String,
        /// Current run.
        run: RunNumber,
        /// Active tag, if any.
        tag: Option<String>,
    },
    /// More than one record matched under the `Error` multiplicity policy.
    #[error("{count} conditions records found for key {key} at run {run} but only one is allowed")]
    MultipleConditionsRecords {
        /// Conditions key.
        key: String,
        /// Current run.
        run: RunNumber,
        /// Number of matching records.
        count: usize,
    },
    /// An operation needed a detector and run number before any were set.
    #[error("the conditions manager has no run number set")]
    NotInitialized,
    /// Cached or converted data was not of the requested type.
    #[error("conditions {key} are not of type {expected}")]
    TypeMismatch {
        /// Conditions key.
        key: String,
        /// Requested type.
        expected: &'static str,
    },
    /// A column value could not be converted to the declared field type.
    #[error("field {field}: expected {expected}, found {found}")]
    FieldMapping {
        /// Field name.
        field: String,
        /// Declared type.
        expected: models::FieldType,
        /// Kind of value found.
        found: String,
    },
    /// A required field was absent from a field map.
    #[error("missing field {0}")]
    MissingField(String),
    /// Fields of a row do not match the table's declared fields.
    #[error("fields [{found}] do not match table {table} fields [{expected}]")]
    FieldSetMismatch {
        /// Table name.
        table: String,
        /// Declared field names.
        expected: String,
        /// Field names of the row.
        found: String,
    },
    /// Field and value lists passed to the query builder differ in length.
    #[error("{fields} field names but {values} values")]
    FieldCountMismatch {
        /// Number of field names.
        fields: usize,
        /// Number of values.
        values: usize,
    },
    /// A query was requested with no fields.
    #[error("no fields given for table {0}")]
    EmptyFieldList(String),
    /// A table or column name contains characters that are not allowed.
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    /// An empty collection cannot be inserted.
    #[error("the collection for table {0} is empty")]
    EmptyCollection(String),
    /// A required connection property was absent.
    #[error("missing connection property: {0}")]
    MissingConnectionProperty(&'static str),
    /// A connection property had an unusable value.
    #[error("invalid value {value:?} for connection property {key}")]
    InvalidConnectionProperty {
        /// Property name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },
    /// The connection properties file does not exist.
    #[error("connection properties file does not exist: {0}")]
    ConnectionFileNotFound(String),
    /// The database could not be reached after every retry.
    #[error("could not connect to {connection} after {attempts} attempts: {source}")]
    ConnectionFailed {
        /// Description of the connection.
        connection: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: rusqlite::Error,
    },
}

fn tag_suffix(tag: &Option<String>) -> String {
    tag.as_ref()
        .map(|tag| format!(" with tag {tag}"))
        .unwrap_or_default()
}

/// Re-exports for the most common types.
pub mod prelude {
    pub use crate::{
        connection::ConnectionParameters,
        converter::MultipleCollectionsAction,
        data::{
            ConditionsObject, ConditionsObjectCollection, ConditionsSeries, FieldValue,
            FieldValueMap, TableBacked,
        },
        manager::{DatabaseConditionsManager, ManagerState},
        models::{ConditionsRecord, ConditionsRecordCollection, TableMetaData},
        ConditionsError, ConditionsResult, Id, RunNumber,
    };
}
