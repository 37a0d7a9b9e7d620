use std::{
    any::{type_name, TypeId},
    fmt::Display,
    sync::Arc,
};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use crate::{
    converter::{ConditionsConverter, ConditionsRecordConverter, ConditionsTagConverter},
    data::{ConditionsObject, ConditionsObjectCollection, FieldValue, FieldValueMap, TableBacked},
    ConditionsResult, Id, RunNumber,
};

/// Key and table name of the validity records table.
pub const CONDITIONS_RECORDS_TABLE: &str = "conditions";

/// Key and table name of the tag membership table.
pub const CONDITIONS_TAGS_TABLE: &str = "conditions_tags";

/// Declared type of a conditions table column.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 64-bit integer
    Int,
    /// Double precision float
    #[default]
    Double,
    /// UTF-8 text
    Text,
    /// Date and time, stored as text
    Timestamp,
}
impl FieldType {
    /// Parses a type name such as `"int"`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "int" => Some(Self::Int),
            "double" => Some(Self::Double),
            "text" => Some(Self::Text),
            "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }

    /// Type name as written in table declarations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Double => "double",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }

    /// Column type used when the table is created in SQLite.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Int => "INTEGER",
            Self::Double => "REAL",
            Self::Text | Self::Timestamp => "TEXT",
        }
    }
}
impl Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name and type of one declared column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub(crate) name: &'static str,
    pub(crate) field_type: FieldType,
}
impl FieldDescriptor {
    /// A column of any type.
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }
    /// An integer column.
    pub const fn int(name: &'static str) -> Self {
        Self::new(name, FieldType::Int)
    }
    /// A double column.
    pub const fn double(name: &'static str) -> Self {
        Self::new(name, FieldType::Double)
    }
    /// A text column.
    pub const fn text(name: &'static str) -> Self {
        Self::new(name, FieldType::Text)
    }
    /// A timestamp column.
    pub const fn timestamp(name: &'static str) -> Self {
        Self::new(name, FieldType::Timestamp)
    }
    /// Column name.
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// Column type.
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
}

/// Describes one conditions table and the Rust types its rows and collections map to.
///
/// The implicit `id` column, and the `collection_id` column of grouped tables, are never part
/// of [`TableMetaData::fields`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetaData {
    pub(crate) table_name: String,
    pub(crate) key: String,
    pub(crate) object_type: TypeId,
    pub(crate) object_type_name: &'static str,
    pub(crate) collection_type: TypeId,
    pub(crate) collection_type_name: &'static str,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) grouped: bool,
}

impl TableMetaData {
    /// Builds the metadata declared by a table-backed row type.
    pub fn of<T: TableBacked>() -> Self {
        Self {
            table_name: T::TABLE_NAME.to_string(),
            key: T::KEY.unwrap_or(T::TABLE_NAME).to_string(),
            object_type: TypeId::of::<T>(),
            object_type_name: type_name::<T>(),
            collection_type: TypeId::of::<ConditionsObjectCollection<T>>(),
            collection_type_name: type_name::<ConditionsObjectCollection<T>>(),
            fields: T::FIELDS.to_vec(),
            grouped: T::GROUPED,
        }
    }
    /// Name of the SQL table.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
    /// Key conditions records refer to the table by.
    pub fn key(&self) -> &str {
        &self.key
    }
    /// [`TypeId`] of the row type.
    pub fn object_type(&self) -> TypeId {
        self.object_type
    }
    /// Name of the row type.
    pub fn object_type_name(&self) -> &'static str {
        self.object_type_name
    }
    /// [`TypeId`] of the row type's collection.
    pub fn collection_type(&self) -> TypeId {
        self.collection_type
    }
    /// Name of the row type's collection.
    pub fn collection_type_name(&self) -> &'static str {
        self.collection_type_name
    }
    /// Declared fields in column order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }
    /// Declared field names in column order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(FieldDescriptor::name)
    }
    /// Declared type of a field.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(FieldDescriptor::field_type)
    }
    /// True if rows are grouped into collections through an implicit `collection_id` column.
    pub fn is_grouped(&self) -> bool {
        self.grouped
    }
}

/// Validity interval of one conditions set, read from the `conditions` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionsRecord {
    pub(crate) row_id: Option<Id>,
    pub(crate) name: String,
    pub(crate) table_name: String,
    pub(crate) collection_id: Id,
    pub(crate) run_start: RunNumber,
    pub(crate) run_end: RunNumber,
    pub(crate) tag: Option<String>,
    pub(crate) created: DateTime<Utc>,
    pub(crate) updated: DateTime<Utc>,
    pub(crate) created_by: Option<String>,
    pub(crate) notes: Option<String>,
}

impl ConditionsRecord {
    /// Creates a new, not yet inserted, record whose creation and update times are now.
    pub fn new(
        name: &str,
        table_name: &str,
        collection_id: Id,
        run_start: RunNumber,
        run_end: RunNumber,
    ) -> Self {
        let now = Utc::now().trunc_subsecs(0);
        Self {
            row_id: None,
            name: name.to_string(),
            table_name: table_name.to_string(),
            collection_id,
            run_start,
            run_end,
            tag: None,
            created: now,
            updated: now,
            created_by: None,
            notes: None,
        }
    }
    /// Restricts the record to a tag.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
    /// Sets the creation time, truncated to seconds.
    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created.trunc_subsecs(0);
        self
    }
    /// Sets the update time, truncated to seconds.
    pub fn with_updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = updated.trunc_subsecs(0);
        self
    }
    /// Sets the author.
    pub fn with_created_by(mut self, created_by: &str) -> Self {
        self.created_by = Some(created_by.to_string());
        self
    }
    /// Sets free-form notes.
    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
    /// Row id, once stored.
    pub fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    /// Conditions key the record applies to.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Table holding the collection.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
    /// Collection the record points at.
    pub fn collection_id(&self) -> Id {
        self.collection_id
    }
    /// First valid run.
    pub fn run_start(&self) -> RunNumber {
        self.run_start
    }
    /// Last valid run.
    pub fn run_end(&self) -> RunNumber {
        self.run_end
    }
    /// Tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
    /// Creation time.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
    /// Last update time.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }
    /// Author, if recorded.
    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }
    /// Notes, if any.
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }
    /// True if the inclusive run range covers `run`.
    pub fn is_valid_for(&self, run: RunNumber) -> bool {
        run >= self.run_start && run <= self.run_end
    }
}

impl ConditionsObject for ConditionsRecord {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            name: values.text("name")?,
            table_name: values.text("table_name")?,
            collection_id: values.int("collection_id")?,
            run_start: values.int("run_start")?,
            run_end: values.int("run_end")?,
            tag: values.optional_text("tag")?,
            created: values.timestamp("created")?,
            updated: values.timestamp("updated")?,
            created_by: values.optional_text("created_by")?,
            notes: values.optional_text("notes")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(Self::FIELDS.len());
        values.insert("name", self.name.as_str());
        values.insert("table_name", self.table_name.as_str());
        values.insert("collection_id", self.collection_id);
        values.insert("run_start", self.run_start);
        values.insert("run_end", self.run_end);
        values.insert("tag", self.tag.clone());
        values.insert("created", self.created);
        values.insert("updated", self.updated);
        values.insert("created_by", self.created_by.clone());
        values.insert("notes", self.notes.clone());
        values
    }
}

impl TableBacked for ConditionsRecord {
    const TABLE_NAME: &'static str = CONDITIONS_RECORDS_TABLE;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::text("name"),
        FieldDescriptor::text("table_name"),
        FieldDescriptor::int("collection_id"),
        FieldDescriptor::int("run_start"),
        FieldDescriptor::int("run_end"),
        FieldDescriptor::text("tag"),
        FieldDescriptor::timestamp("created"),
        FieldDescriptor::timestamp("updated"),
        FieldDescriptor::text("created_by"),
        FieldDescriptor::text("notes"),
    ];
    const GROUPED: bool = false;

    fn converter() -> Option<Arc<dyn ConditionsConverter>> {
        Some(Arc::new(ConditionsRecordConverter))
    }
}

/// Conditions records, as loaded from the `conditions` table.
pub type ConditionsRecordCollection = ConditionsObjectCollection<ConditionsRecord>;

impl ConditionsRecordCollection {
    /// Records whose name equals `key`, in collection order.
    pub fn find_by_key(&self, key: &str) -> ConditionsRecordCollection {
        let mut found = ConditionsRecordCollection::new();
        if let Some(meta) = self.table_meta() {
            found.set_table_meta(meta.clone());
        }
        for record in self.iter().filter(|record| record.name == key) {
            found.push(record.clone());
        }
        found
    }
}

/// Membership of one conditions record in a named tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionsTag {
    pub(crate) row_id: Option<Id>,
    pub(crate) conditions_id: Id,
    pub(crate) tag: String,
}

impl ConditionsTag {
    /// Adds record `conditions_id` to `tag`.
    pub fn new(conditions_id: Id, tag: &str) -> Self {
        Self {
            row_id: None,
            conditions_id,
            tag: tag.to_string(),
        }
    }
    /// Row id of the tagged record.
    pub fn conditions_id(&self) -> Id {
        self.conditions_id
    }
    /// Tag name.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl ConditionsObject for ConditionsTag {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            conditions_id: values.int("conditions_id")?,
            tag: values.text("tag")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(2);
        values.insert("conditions_id", self.conditions_id);
        values.insert("tag", FieldValue::Text(self.tag.clone()));
        values
    }
}

impl TableBacked for ConditionsTag {
    const TABLE_NAME: &'static str = CONDITIONS_TAGS_TABLE;
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("conditions_id"),
        FieldDescriptor::text("tag"),
    ];
    const GROUPED: bool = false;

    fn converter() -> Option<Arc<dyn ConditionsConverter>> {
        Some(Arc::new(ConditionsTagConverter))
    }
}

/// Members of a tag.
pub type ConditionsTagCollection = ConditionsObjectCollection<ConditionsTag>;

impl ConditionsTagCollection {
    /// Ids of the conditions records that belong to the tag.
    pub fn conditions_ids(&self) -> Vec<Id> {
        self.iter().map(ConditionsTag::conditions_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn metadata_excludes_implicit_columns() {
        let meta = TableMetaData::of::<ConditionsTag>();
        assert_eq!(meta.table_name(), "conditions_tags");
        assert_eq!(meta.key(), "conditions_tags");
        assert_eq!(
            meta.field_names().collect::<Vec<_>>(),
            vec!["conditions_id", "tag"]
        );
        assert!(!meta.is_grouped());
        assert_eq!(meta.field_type("tag"), Some(FieldType::Text));
        assert_eq!(meta.field_type("id"), None);
    }

    #[test]
    fn record_field_values_round_trip() {
        let created = Utc.with_ymd_and_hms(2015, 4, 1, 12, 0, 0).unwrap();
        let record = ConditionsRecord::new("ecal_gains", "ecal_gains", 3, 100, 200)
            .with_tag("pass1")
            .with_created(created)
            .with_updated(created)
            .with_notes("initial gains");
        let values = record.field_values();
        assert_eq!(
            values.names().collect::<Vec<_>>(),
            ConditionsRecord::FIELDS
                .iter()
                .map(|f| f.name())
                .collect::<Vec<_>>()
        );
        let decoded = ConditionsRecord::from_field_values(None, &values).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_valid_for(100));
        assert!(decoded.is_valid_for(200));
        assert!(!decoded.is_valid_for(201));
    }
}
