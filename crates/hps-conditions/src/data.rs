use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use hps_core::parsers::{format_timestamp, parse_timestamp};
use rusqlite::{
    types::{ToSqlOutput, Value, ValueRef},
    ToSql,
};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};

use crate::{
    converter::{ConditionsConverter, MultipleCollectionsAction},
    models::{ConditionsRecord, FieldDescriptor, FieldType, TableMetaData},
    ConditionsError, ConditionsResult, Id,
};

/// A single column value as read from or written to a conditions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// SQL `NULL`
    Null,
    /// Integer column value
    Integer(i64),
    /// Double column value
    Real(f64),
    /// Text column value
    Text(String),
    /// Timestamp column value, stored as text
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Integer(_) => "integer",
            FieldValue::Real(_) => "real",
            FieldValue::Text(_) => "text",
            FieldValue::Timestamp(_) => "timestamp",
        }
    }

    /// Reads a raw SQLite value and converts it to the declared type of `field`.
    pub fn from_sql(value: ValueRef<'_>, field: &FieldDescriptor) -> ConditionsResult<Self> {
        let raw = match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(f) => FieldValue::Real(f),
            ValueRef::Text(bytes) => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(_) => {
                return Err(ConditionsError::FieldMapping {
                    field: field.name().to_string(),
                    expected: field.field_type(),
                    found: "blob".to_string(),
                })
            }
        };
        raw.coerce(field)
    }

    /// Converts the value to the declared type of `field`.
    ///
    /// Integers widen to doubles, text and integer epoch seconds become timestamps, and `Null`
    /// is accepted for every type. Anything else is a [`ConditionsError::FieldMapping`].
    #[allow(clippy::cast_precision_loss)]
    pub fn coerce(self, field: &FieldDescriptor) -> ConditionsResult<Self> {
        let mismatch = |found: &FieldValue| ConditionsError::FieldMapping {
            field: field.name().to_string(),
            expected: field.field_type(),
            found: found.kind().to_string(),
        };
        match (field.field_type(), self) {
            (_, FieldValue::Null) => Ok(FieldValue::Null),
            (FieldType::Int, v @ FieldValue::Integer(_))
            | (FieldType::Double, v @ FieldValue::Real(_))
            | (FieldType::Text, v @ FieldValue::Text(_))
            | (FieldType::Timestamp, v @ FieldValue::Timestamp(_)) => Ok(v),
            (FieldType::Double, FieldValue::Integer(i)) => Ok(FieldValue::Real(i as f64)),
            (FieldType::Timestamp, FieldValue::Text(s)) => {
                Ok(FieldValue::Timestamp(parse_timestamp(&s)?))
            }
            (FieldType::Timestamp, v @ FieldValue::Integer(i)) => DateTime::from_timestamp(i, 0)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| mismatch(&v)),
            (_, v) => Err(mismatch(&v)),
        }
    }

    /// Renders the value as an SQL literal with quotes escaped.
    pub fn to_sql_literal(&self) -> String {
        match self {
            FieldValue::Null => "NULL".to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Real(f) => format!("{f:?}"),
            FieldValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            FieldValue::Timestamp(t) => format!("'{}'", format_timestamp(t)),
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
    /// The integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
    /// The value as a double. Integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Real(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
    /// The text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
    /// The timestamp, parsing text if needed.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            FieldValue::Text(s) => parse_timestamp(s).ok(),
            _ => None,
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            FieldValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Timestamp(t) => ToSqlOutput::Owned(Value::Text(format_timestamp(t))),
        })
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}
impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}
impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}
impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}
impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}
impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Ordered mapping of field names to values for one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValueMap {
    entries: Vec<(String, FieldValue)>,
}

impl FieldValueMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }
    /// An empty map with room for `capacity` fields.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }
    /// Sets `name` to `value`, replacing an existing entry in place.
    pub fn insert(&mut self, name: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }
    /// Value of a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
    /// Returns true if the field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
    /// Field names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &FieldValue> {
        self.entries.iter().map(|(_, v)| v)
    }
    /// Name and value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Returns true if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn require(&self, name: &str) -> ConditionsResult<&FieldValue> {
        self.get(name)
            .ok_or_else(|| ConditionsError::MissingField(name.to_string()))
    }
    fn mismatch(name: &str, expected: FieldType, found: &FieldValue) -> ConditionsError {
        ConditionsError::FieldMapping {
            field: name.to_string(),
            expected,
            found: found.kind().to_string(),
        }
    }

    /// A required integer field.
    pub fn int(&self, name: &str) -> ConditionsResult<i64> {
        let value = self.require(name)?;
        value
            .as_int()
            .ok_or_else(|| Self::mismatch(name, FieldType::Int, value))
    }
    /// An integer field that may be `Null`.
    pub fn optional_int(&self, name: &str) -> ConditionsResult<Option<i64>> {
        match self.get(name) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Integer(i)) => Ok(Some(*i)),
            Some(other) => Err(Self::mismatch(name, FieldType::Int, other)),
        }
    }
    /// A required double field. Integers are widened.
    pub fn double(&self, name: &str) -> ConditionsResult<f64> {
        let value = self.require(name)?;
        value
            .as_double()
            .ok_or_else(|| Self::mismatch(name, FieldType::Double, value))
    }
    /// A required text field.
    pub fn text(&self, name: &str) -> ConditionsResult<String> {
        let value = self.require(name)?;
        value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| Self::mismatch(name, FieldType::Text, value))
    }
    /// A text field that may be `Null`.
    pub fn optional_text(&self, name: &str) -> ConditionsResult<Option<String>> {
        match self.get(name) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::mismatch(name, FieldType::Text, other)),
        }
    }
    /// A required timestamp field.
    pub fn timestamp(&self, name: &str) -> ConditionsResult<DateTime<Utc>> {
        match self.require(name)? {
            FieldValue::Timestamp(t) => Ok(*t),
            FieldValue::Text(s) => Ok(parse_timestamp(s)?),
            other => Err(Self::mismatch(name, FieldType::Timestamp, other)),
        }
    }
}

impl Serialize for FieldValueMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'a> IntoIterator for &'a FieldValueMap {
    type Item = &'a (String, FieldValue);
    type IntoIter = std::slice::Iter<'a, (String, FieldValue)>;
    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<S: Into<String>, V: Into<FieldValue>> FromIterator<(S, V)> for FieldValueMap {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Self {
        let mut map = FieldValueMap::new();
        for (name, value) in iter {
            let name: String = name.into();
            map.insert(&name, value);
        }
        map
    }
}

/// A row of a conditions table.
///
/// Implementors build themselves from the named column values of one row and can report those
/// values back for inserts.
pub trait ConditionsObject: Clone + Debug + Send + Sync + 'static {
    /// Builds the object from one row. `row_id` is `None` for rows that were never stored.
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self>;
    /// Row id in its table, once stored.
    fn row_id(&self) -> Option<Id>;
    /// Records the row id assigned on insert.
    fn set_row_id(&mut self, row_id: Id);
    /// Column values in declared field order.
    fn field_values(&self) -> FieldValueMap;
}

/// A row type stored in a named table with a fixed set of declared fields.
pub trait TableBacked: ConditionsObject {
    /// Name of the table the rows are stored in.
    const TABLE_NAME: &'static str;
    /// Declared fields, in column order, excluding `id` and `collection_id`.
    const FIELDS: &'static [FieldDescriptor];
    /// Lookup key of the conditions records. Defaults to the table name.
    const KEY: Option<&'static str> = None;
    /// Whether rows carry an implicit `collection_id` column.
    const GROUPED: bool = true;

    /// Policy applied when several records are valid for the same run.
    fn multiple_collections() -> MultipleCollectionsAction {
        MultipleCollectionsAction::default()
    }

    /// A converter that replaces the generic row converter for this type.
    fn converter() -> Option<Arc<dyn ConditionsConverter>> {
        None
    }
}

/// An ordered set of rows that share one collection id.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionsObjectCollection<T> {
    #[serde(skip)]
    pub(crate) table_meta: Option<Arc<TableMetaData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) record: Option<ConditionsRecord>,
    pub(crate) collection_id: Option<Id>,
    pub(crate) objects: Vec<T>,
}

impl<T> Default for ConditionsObjectCollection<T> {
    fn default() -> Self {
        Self {
            table_meta: None,
            record: None,
            collection_id: None,
            objects: Vec::new(),
        }
    }
}

impl<T> ConditionsObjectCollection<T> {
    /// An empty collection without table metadata.
    pub fn new() -> Self {
        Self::default()
    }
    /// An empty collection whose rows are checked against `table_meta`.
    pub fn with_table_meta(table_meta: Arc<TableMetaData>) -> Self {
        Self {
            table_meta: Some(table_meta),
            ..Self::default()
        }
    }
    /// Table metadata, if known.
    pub fn table_meta(&self) -> Option<&Arc<TableMetaData>> {
        self.table_meta.as_ref()
    }
    /// Attaches table metadata.
    pub fn set_table_meta(&mut self, table_meta: Arc<TableMetaData>) {
        self.table_meta = Some(table_meta);
    }
    /// The conditions record this collection was resolved from, if it came from a single one.
    pub fn record(&self) -> Option<&ConditionsRecord> {
        self.record.as_ref()
    }
    /// Attaches the record the collection was resolved from.
    pub fn set_record(&mut self, record: ConditionsRecord) {
        self.record = Some(record);
    }
    /// Collection id, once stored or resolved from a single record.
    pub fn collection_id(&self) -> Option<Id> {
        self.collection_id
    }
    /// Sets the collection id.
    pub fn set_collection_id(&mut self, collection_id: Id) {
        self.collection_id = Some(collection_id);
    }
    pub(crate) fn push(&mut self, object: T) {
        self.objects.push(object);
    }
    /// Row at `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.objects.get(index)
    }
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.objects.len()
    }
    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
    /// Iterates over the rows.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.objects.iter()
    }
    /// The rows as a slice.
    pub fn objects(&self) -> &[T] {
        &self.objects
    }
    pub(crate) fn objects_mut(&mut self) -> &mut [T] {
        &mut self.objects
    }
    /// Takes the rows out of the collection.
    pub fn into_objects(self) -> Vec<T> {
        self.objects
    }
    /// First row matching `predicate`.
    pub fn find<P: FnMut(&T) -> bool>(&self, mut predicate: P) -> Option<&T> {
        self.objects.iter().find(|o| predicate(o))
    }
    /// Sorts the rows in place.
    pub fn sort_by<F: FnMut(&T, &T) -> std::cmp::Ordering>(&mut self, compare: F) {
        self.objects.sort_by(compare);
    }
}

impl<T: Clone> ConditionsObjectCollection<T> {
    /// Returns a sorted copy, leaving this collection untouched.
    pub fn sorted_by<F: FnMut(&T, &T) -> std::cmp::Ordering>(&self, compare: F) -> Self {
        let mut sorted = self.clone();
        sorted.sort_by(compare);
        sorted
    }
}

impl<T: ConditionsObject> ConditionsObjectCollection<T> {
    /// Adds a row after checking its fields against the table's declared fields.
    pub fn add(&mut self, object: T) -> ConditionsResult<()> {
        if let Some(meta) = &self.table_meta {
            let values = object.field_values();
            if !values.names().eq(meta.field_names()) {
                return Err(ConditionsError::FieldSetMismatch {
                    table: meta.table_name().to_string(),
                    expected: itertools::join(meta.field_names(), ", "),
                    found: itertools::join(values.names(), ", "),
                });
            }
        }
        self.objects.push(object);
        Ok(())
    }
}

impl<T> IntoIterator for ConditionsObjectCollection<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;
    fn into_iter(self) -> Self::IntoIter {
        self.objects.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ConditionsObjectCollection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.objects.iter()
    }
}

/// Every collection of one key that is valid for the current run, in record order.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionsSeries<T> {
    collections: Vec<ConditionsObjectCollection<T>>,
}

impl<T> Default for ConditionsSeries<T> {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
        }
    }
}

impl<T> ConditionsSeries<T> {
    /// An empty series.
    pub fn new() -> Self {
        Self::default()
    }
    /// Appends a collection.
    pub fn push(&mut self, collection: ConditionsObjectCollection<T>) {
        self.collections.push(collection);
    }
    /// Collection at `index`.
    pub fn get(&self, index: usize) -> Option<&ConditionsObjectCollection<T>> {
        self.collections.get(index)
    }
    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }
    /// Returns true if no collections were found.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
    /// Iterates over the collections.
    pub fn iter(&self) -> std::slice::Iter<'_, ConditionsObjectCollection<T>> {
        self.collections.iter()
    }
}

impl<T> IntoIterator for ConditionsSeries<T> {
    type Item = ConditionsObjectCollection<T>;
    type IntoIter = std::vec::IntoIter<ConditionsObjectCollection<T>>;
    fn into_iter(self) -> Self::IntoIter {
        self.collections.into_iter()
    }
}

/// A row whose fields are only known through the table metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenericObject {
    #[serde(rename = "id")]
    pub(crate) row_id: Option<Id>,
    #[serde(flatten)]
    pub(crate) values: FieldValueMap,
}

impl GenericObject {
    /// A row that has not been stored yet.
    pub fn new(values: FieldValueMap) -> Self {
        Self {
            row_id: None,
            values,
        }
    }
    /// Field values of the row.
    pub fn values(&self) -> &FieldValueMap {
        &self.values
    }
    /// Value of one field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }
}

impl ConditionsObject for GenericObject {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            values: values.clone(),
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        self.values.clone()
    }
}
