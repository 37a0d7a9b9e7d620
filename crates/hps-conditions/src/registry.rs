use std::{
    any::{type_name, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use crate::{
    converter::{ConditionsConverter, ConditionsObjectConverter},
    data::TableBacked,
    ecal::{EcalBadChannel, EcalCalibration, EcalChannel, EcalGain},
    models::{ConditionsRecord, ConditionsTag, TableMetaData},
    svt::{SvtBadChannel, SvtChannel, SvtGain},
    ConditionsError, ConditionsResult,
};

/// One table-backed row type, with its metadata and the converter that loads it.
#[derive(Clone)]
pub struct TableDeclaration {
    meta: TableMetaData,
    row_type: &'static str,
    converter: Arc<dyn ConditionsConverter>,
}

impl TableDeclaration {
    /// Declares `T` under its own table, with its own converter or the generic one.
    pub fn of<T: TableBacked>() -> Self {
        Self {
            meta: TableMetaData::of::<T>(),
            row_type: type_name::<T>(),
            converter: T::converter()
                .unwrap_or_else(|| Arc::new(ConditionsObjectConverter::<T>::default())),
        }
    }
    /// Stores the rows in `table_name` instead of the type's own table. The key follows along
    /// unless the type declares its own.
    pub fn with_table_name(mut self, table_name: &str) -> Self {
        if self.meta.key == self.meta.table_name {
            self.meta.key = table_name.to_string();
        }
        self.meta.table_name = table_name.to_string();
        self
    }
    /// Table metadata of the declaration.
    pub fn meta(&self) -> &TableMetaData {
        &self.meta
    }
    /// Converter that loads the declared collection.
    pub fn converter(&self) -> &Arc<dyn ConditionsConverter> {
        &self.converter
    }
}

impl fmt::Debug for TableDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDeclaration")
            .field("table_name", &self.meta.table_name)
            .field("row_type", &self.row_type)
            .field("converter", &self.converter.output_type_name())
            .finish()
    }
}

/// Every table known to the conditions system.
pub fn default_declarations() -> Vec<TableDeclaration> {
    vec![
        TableDeclaration::of::<ConditionsRecord>(),
        TableDeclaration::of::<ConditionsTag>(),
        TableDeclaration::of::<EcalChannel>(),
        TableDeclaration::of::<EcalGain>(),
        TableDeclaration::of::<EcalCalibration>(),
        TableDeclaration::of::<EcalBadChannel>(),
        TableDeclaration::of::<SvtChannel>(),
        TableDeclaration::of::<SvtGain>(),
        TableDeclaration::of::<SvtBadChannel>(),
    ]
}

/// Lookup of [`TableMetaData`] by table name, key, row type and collection type.
#[derive(Debug, Default, Clone)]
pub struct TableRegistry {
    by_table_name: HashMap<String, Arc<TableMetaData>>,
    by_key: HashMap<String, Arc<TableMetaData>>,
    by_object_type: HashMap<TypeId, Arc<TableMetaData>>,
    by_collection_type: HashMap<TypeId, Arc<TableMetaData>>,
}

impl TableRegistry {
    /// Builds the registry, failing on the first conflicting declaration.
    pub fn from_declarations(declarations: &[TableDeclaration]) -> ConditionsResult<Self> {
        let mut registry = Self::default();
        for declaration in declarations {
            let meta = &declaration.meta;
            if let Some(existing) = registry.by_table_name.get(meta.table_name()) {
                if existing.as_ref() == meta {
                    continue;
                }
                return Err(ConditionsError::DuplicateTableName {
                    table: meta.table_name.clone(),
                    first: existing.object_type_name(),
                    second: meta.object_type_name(),
                });
            }
            if let Some(existing) = registry.by_object_type.get(&meta.object_type()) {
                return Err(ConditionsError::DuplicateObjectType {
                    object_type: meta.object_type_name(),
                    first: existing.table_name.clone(),
                    second: meta.table_name.clone(),
                });
            }
            let meta = Arc::new(meta.clone());
            registry
                .by_table_name
                .insert(meta.table_name.clone(), meta.clone());
            registry.by_key.insert(meta.key.clone(), meta.clone());
            registry
                .by_object_type
                .insert(meta.object_type(), meta.clone());
            registry
                .by_collection_type
                .insert(meta.collection_type(), meta);
        }
        Ok(registry)
    }
    /// Metadata of the table with this name.
    pub fn find_by_table_name(&self, table_name: &str) -> Option<Arc<TableMetaData>> {
        self.by_table_name.get(table_name).cloned()
    }
    /// Metadata registered under this conditions key.
    pub fn find_by_key(&self, key: &str) -> Option<Arc<TableMetaData>> {
        self.by_key.get(key).cloned()
    }
    /// Metadata of the table storing rows of this type.
    pub fn find_by_object_type(&self, object_type: TypeId) -> Option<Arc<TableMetaData>> {
        self.by_object_type.get(&object_type).cloned()
    }
    /// Metadata of the table whose collection type this is.
    pub fn find_by_collection_type(&self, collection_type: TypeId) -> Option<Arc<TableMetaData>> {
        self.by_collection_type.get(&collection_type).cloned()
    }
    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }
    /// Registered table metadata, sorted by table name.
    pub fn tables(&self) -> Vec<Arc<TableMetaData>> {
        let mut tables: Vec<Arc<TableMetaData>> = self.by_table_name.values().cloned().collect();
        tables.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        tables
    }
    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.by_table_name.len()
    }
    /// Returns true if no tables are registered.
    pub fn is_empty(&self) -> bool {
        self.by_table_name.is_empty()
    }
}

/// Converters indexed by the type they produce.
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<TypeId, Arc<dyn ConditionsConverter>>,
}

impl ConverterRegistry {
    /// Collects one converter per declaration after checking it yields the declared collection.
    pub fn from_declarations(declarations: &[TableDeclaration]) -> ConditionsResult<Self> {
        let mut registry = Self::default();
        for declaration in declarations {
            let converter = &declaration.converter;
            let meta = &declaration.meta;
            if converter.output_type() != meta.collection_type() {
                return Err(ConditionsError::InvalidConverter {
                    row_type: declaration.row_type,
                    expected: meta.collection_type_name(),
                    found: converter.output_type_name(),
                });
            }
            registry.register(converter.clone());
        }
        Ok(registry)
    }
    /// Adds a converter, replacing any converter with the same output type.
    pub fn register(&mut self, converter: Arc<dyn ConditionsConverter>) {
        self.converters.insert(converter.output_type(), converter);
    }
    /// Converter producing the type with this [`TypeId`].
    pub fn find(&self, output_type: TypeId) -> Option<Arc<dyn ConditionsConverter>> {
        self.converters.get(&output_type).cloned()
    }
    /// Number of registered converters.
    pub fn len(&self) -> usize {
        self.converters.len()
    }
    /// Returns true if no converters are registered.
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.converters.values().map(|c| c.output_type_name()))
            .finish()
    }
}
