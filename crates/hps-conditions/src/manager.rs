use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    path::Path,
    sync::Arc,
    thread,
    time::Duration,
};

use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, warn};

use crate::{
    config::{ConditionsConfig, ConfigResource},
    connection::{ConnectionParameters, ConnectionResource, RetryPolicy},
    converter::{
        read_collection, ConditionsConverter, ConditionsDataConverter, ConditionsSeriesConverter,
        MultipleCollectionsAction,
    },
    data::{
        ConditionsObject, ConditionsObjectCollection, ConditionsSeries, FieldValue, FieldValueMap,
        GenericObject, TableBacked,
    },
    ecal::EcalConditionsConverter,
    models::{ConditionsRecord, ConditionsRecordCollection, TableMetaData, CONDITIONS_RECORDS_TABLE},
    query::{
        build_collection_exists, build_create_table, build_next_collection_id,
        build_prepared_insert,
    },
    registry::{default_declarations, ConverterRegistry, TableDeclaration, TableRegistry},
    setup::{DetectorSetup, SubDetector},
    svt::SvtConditionsConverter,
    ConditionsError, ConditionsResult, Id, RunNumber,
};

/// Behaviour switches of the manager, normally set from an XML configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Run the SVT setup after initialization.
    pub setup_svt_detector: bool,
    /// Run the ECal setup after initialization.
    pub setup_ecal_detector: bool,
    /// Name handed to the ECal setup.
    pub ecal_name: String,
    /// Name handed to the SVT setup.
    pub svt_name: String,
    /// Freeze once initialization succeeds.
    pub freeze_after_initialize: bool,
    /// Load every registered key during initialization.
    pub cache_all_conditions: bool,
    /// Selects the Test Run variants of the ECal and SVT converters.
    pub is_test_run: bool,
    /// Close the connection once initialization is done.
    pub close_connection_after_initialize: bool,
    /// How long SQLite waits on a locked database.
    pub login_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            setup_svt_detector: true,
            setup_ecal_detector: true,
            ecal_name: "Ecal".to_string(),
            svt_name: "Tracker".to_string(),
            freeze_after_initialize: false,
            cache_all_conditions: false,
            is_test_run: false,
            close_connection_after_initialize: true,
            login_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a [`DatabaseConditionsManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ManagerState {
    /// No detector and run set yet, or the last initialization failed.
    #[default]
    Uninitialized,
    /// Conditions are loaded for a detector and run.
    Initialized {
        /// Detector name.
        detector: String,
        /// Run number.
        run: RunNumber,
    },
    /// Initialized, and ignoring further detector or run changes.
    Frozen {
        /// Detector name.
        detector: String,
        /// Run number.
        run: RunNumber,
    },
}

impl ManagerState {
    /// Detector name, unless uninitialized.
    pub fn detector(&self) -> Option<&str> {
        match self {
            Self::Uninitialized => None,
            Self::Initialized { detector, .. } | Self::Frozen { detector, .. } => Some(detector),
        }
    }
    /// Run number, unless uninitialized.
    pub fn run(&self) -> Option<RunNumber> {
        match self {
            Self::Uninitialized => None,
            Self::Initialized { run, .. } | Self::Frozen { run, .. } => Some(*run),
        }
    }
}

type CachedData = Arc<dyn Any + Send + Sync>;

/// Resolves and caches conditions for one detector and run at a time.
///
/// Every operation that can change the manager takes `&mut self`. Callers that share a manager
/// between threads wrap it in a `Mutex`.
pub struct DatabaseConditionsManager {
    state: ManagerState,
    settings: ManagerSettings,
    configured: bool,
    tag: Option<String>,
    parameters: Option<ConnectionParameters>,
    retry_policy: RetryPolicy,
    connection: Option<Connection>,
    tables: Arc<TableRegistry>,
    converters: ConverterRegistry,
    cache: HashMap<(TypeId, String), CachedData>,
    setups: Vec<Box<dyn DetectorSetup + Send>>,
}

impl fmt::Debug for DatabaseConditionsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConditionsManager")
            .field("state", &self.state)
            .field("tag", &self.tag)
            .field("parameters", &self.parameters)
            .field("connected", &self.connection.is_some())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl DatabaseConditionsManager {
    /// Creates a manager for the default tables.
    ///
    /// Connection parameters come from the file named by
    /// [`crate::connection::CONNECTION_ENV_VAR`] if it is set. Otherwise one of the canned
    /// resources is picked when the first connection is opened.
    pub fn new() -> ConditionsResult<Self> {
        let parameters = ConnectionParameters::from_env()?;
        Self::from_declarations(&default_declarations(), parameters)
    }

    /// Creates a manager for the default tables that connects with `parameters`.
    pub fn with_parameters(parameters: ConnectionParameters) -> ConditionsResult<Self> {
        Self::from_declarations(&default_declarations(), Some(parameters))
    }

    /// A manager over custom table declarations. Without parameters the connection is chosen
    /// when it is first needed.
    pub fn from_declarations(
        declarations: &[TableDeclaration],
        parameters: Option<ConnectionParameters>,
    ) -> ConditionsResult<Self> {
        let tables = TableRegistry::from_declarations(declarations)?;
        let converters = ConverterRegistry::from_declarations(declarations)?;
        Ok(Self {
            state: ManagerState::Uninitialized,
            settings: ManagerSettings::default(),
            configured: false,
            tag: None,
            parameters,
            retry_policy: RetryPolicy::default(),
            connection: None,
            tables: Arc::new(tables),
            converters,
            cache: HashMap::new(),
            setups: Vec::new(),
        })
    }

    /// Current behaviour switches.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }
    /// Mutable access to the behaviour switches.
    pub fn settings_mut(&mut self) -> &mut ManagerSettings {
        &mut self.settings
    }
    /// Returns true once a configuration has been applied.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Applies an XML configuration. Only the first configuration takes effect.
    pub fn configure(&mut self, config: &ConditionsConfig) {
        if self.configured {
            warn!("conditions system is already configured, ignoring new configuration");
            return;
        }
        config.apply(&mut self.settings);
        self.configured = true;
    }
    /// Applies a bundled XML configuration.
    pub fn configure_resource(&mut self, resource: ConfigResource) -> ConditionsResult<()> {
        info!("configuring conditions system from {resource} resource");
        self.configure(&resource.load()?);
        Ok(())
    }
    /// Applies an XML configuration file.
    pub fn configure_file(&mut self, path: impl AsRef<Path>) -> ConditionsResult<()> {
        let path = path.as_ref();
        info!("configuring conditions system from {}", path.display());
        self.configure(&ConditionsConfig::from_file(path)?);
        Ok(())
    }

    /// Connection parameters for the next connection.
    pub fn set_connection_parameters(&mut self, parameters: ConnectionParameters) {
        self.parameters = Some(parameters);
    }
    /// Reads connection parameters from a properties file.
    pub fn set_connection_file(&mut self, path: impl AsRef<Path>) -> ConditionsResult<()> {
        self.parameters = Some(ConnectionParameters::from_file(path)?);
        Ok(())
    }
    /// Uses a bundled connection resource.
    pub fn set_connection_resource(&mut self, resource: ConnectionResource) -> ConditionsResult<()> {
        self.parameters = Some(resource.parameters()?);
        Ok(())
    }
    /// Retry policy for opening connections.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.retry_policy = retry_policy;
    }

    fn connection_parameters(&mut self) -> ConditionsResult<ConnectionParameters> {
        if let Some(parameters) = &self.parameters {
            return Ok(parameters.clone());
        }
        let resource = ConnectionResource::select();
        info!("using {resource} connection resource");
        let parameters = resource.parameters()?;
        self.parameters = Some(parameters.clone());
        Ok(parameters)
    }

    /// Restricts record lookup to records carrying `tag`. Cached conditions are dropped.
    pub fn set_tag(&mut self, tag: Option<&str>) {
        let tag = tag.map(str::to_string);
        if tag != self.tag {
            info!("conditions tag set to {tag:?}");
            self.tag = tag;
            self.cache.clear();
        }
    }
    /// Active tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Lifecycle state.
    pub fn state(&self) -> &ManagerState {
        &self.state
    }
    /// Current detector name.
    pub fn detector_name(&self) -> Option<&str> {
        self.state.detector()
    }
    /// Current run number.
    pub fn run_number(&self) -> Option<RunNumber> {
        self.state.run()
    }
    /// Returns true when initialized or frozen.
    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, ManagerState::Uninitialized)
    }
    /// Returns true when frozen.
    pub fn is_frozen(&self) -> bool {
        matches!(self.state, ManagerState::Frozen { .. })
    }

    /// Loads conditions for `detector` and `run`.
    ///
    /// Nothing happens when the manager is frozen or already set to the same detector and run.
    pub fn set_detector(&mut self, detector: &str, run: RunNumber) -> ConditionsResult<()> {
        if self.is_frozen() {
            debug!("conditions system is frozen, ignoring detector {detector} and run {run}");
            return Ok(());
        }
        let unchanged = matches!(
            &self.state,
            ManagerState::Initialized { detector: d, run: r } if d == detector && *r == run
        );
        if unchanged {
            debug!("conditions already set for detector {detector} and run {run}");
            return Ok(());
        }
        self.initialize(detector, run)
    }

    fn initialize(&mut self, detector: &str, run: RunNumber) -> ConditionsResult<()> {
        info!("initializing conditions for detector {detector} and run {run}");
        if !self.configured && run > 0 {
            self.configure_resource(ConfigResource::for_run(run))?;
        }
        self.register_run_converters();
        self.cache.clear();
        self.state = ManagerState::Initialized {
            detector: detector.to_string(),
            run,
        };
        if let Err(e) = self.load_conditions_records() {
            self.close_connection();
            self.state = ManagerState::Uninitialized;
            return Err(e);
        }
        self.run_detector_setups();
        if self.settings.cache_all_conditions {
            self.cache_all_conditions();
        }
        if self.settings.close_connection_after_initialize {
            self.close_connection();
        }
        if self.settings.freeze_after_initialize {
            self.freeze();
        }
        info!("conditions initialized for detector {detector} and run {run}");
        Ok(())
    }

    fn register_run_converters(&mut self) {
        if self.settings.is_test_run {
            debug!("registering Test Run ECal and SVT converters");
            self.converters
                .register(Arc::new(EcalConditionsConverter::test_run()));
            self.converters
                .register(Arc::new(SvtConditionsConverter::test_run()));
        } else {
            self.converters
                .register(Arc::new(EcalConditionsConverter::default()));
            self.converters
                .register(Arc::new(SvtConditionsConverter::default()));
        }
    }

    fn load_conditions_records(&mut self) -> ConditionsResult<()> {
        self.open_connection()?;
        let records =
            self.get_cached_conditions::<ConditionsRecordCollection>(CONDITIONS_RECORDS_TABLE)?;
        info!(
            "loaded {} conditions records for run {:?}",
            records.len(),
            self.run_number()
        );
        Ok(())
    }

    fn run_detector_setups(&mut self) {
        let mut setups = std::mem::take(&mut self.setups);
        for setup in &mut setups {
            let (enabled, name) = match setup.subdetector() {
                SubDetector::Ecal => (
                    self.settings.setup_ecal_detector,
                    self.settings.ecal_name.clone(),
                ),
                SubDetector::Svt => (
                    self.settings.setup_svt_detector,
                    self.settings.svt_name.clone(),
                ),
            };
            if !enabled {
                debug!("{} setup is disabled", setup.subdetector());
                continue;
            }
            setup.set_subdetector_name(&name);
            if let Err(e) = setup.conditions_changed(self) {
                warn!("{} setup of {name} failed: {e}", setup.subdetector());
            }
        }
        setups.append(&mut self.setups);
        self.setups = setups;
    }

    fn cache_all_conditions(&mut self) {
        for meta in self.tables.tables() {
            if let Err(e) =
                self.cached_any(meta.collection_type(), meta.collection_type_name(), meta.key())
            {
                warn!("could not cache conditions {}: {e}", meta.key());
            }
        }
    }

    /// Adds a sub-detector hook that runs after every initialization.
    pub fn add_detector_setup(&mut self, setup: Box<dyn DetectorSetup + Send>) {
        self.setups.push(setup);
    }

    /// Stops detector and run changes from reloading conditions.
    pub fn freeze(&mut self) {
        match std::mem::take(&mut self.state) {
            ManagerState::Initialized { detector, run } => {
                info!("conditions system frozen at detector {detector} and run {run}");
                self.state = ManagerState::Frozen { detector, run };
            }
            other => {
                warn!("conditions system cannot be frozen while {other:?}");
                self.state = other;
            }
        }
    }

    /// Returns a frozen manager to the initialized state.
    pub fn unfreeze(&mut self) {
        match std::mem::take(&mut self.state) {
            ManagerState::Frozen { detector, run } => {
                info!("conditions system unfrozen");
                self.state = ManagerState::Initialized { detector, run };
            }
            other => {
                debug!("conditions system is not frozen");
                self.state = other;
            }
        }
    }

    /// Opens a connection unless one is open. Returns true if this call opened it.
    pub fn open_connection(&mut self) -> ConditionsResult<bool> {
        if self.connection.is_some() {
            return Ok(false);
        }
        let connection = self.create_connection()?;
        self.connection = Some(connection);
        Ok(true)
    }

    fn create_connection(&mut self) -> ConditionsResult<Connection> {
        let parameters = self.connection_parameters()?;
        info!("opening conditions database connection to {parameters}");
        parameters.create_connection_with(
            &self.retry_policy,
            self.settings.login_timeout,
            thread::sleep,
        )
    }

    /// Closes the connection if one is open.
    pub fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            match connection.close() {
                Ok(()) => debug!("conditions database connection closed"),
                Err((_, e)) => warn!("error closing conditions database connection: {e}"),
            }
        }
    }

    /// Returns true if a connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The open connection, opening one first if needed.
    pub fn connection(&mut self) -> ConditionsResult<&Connection> {
        self.connection_mut().map(|connection| &*connection)
    }

    fn connection_mut(&mut self) -> ConditionsResult<&mut Connection> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.create_connection()?,
        };
        Ok(self.connection.insert(connection))
    }

    /// Runs `f` with an open connection.
    ///
    /// A connection opened here is closed again when `f` returns, whether or not it succeeded.
    /// A connection that was already open is left open.
    pub fn with_connection<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> ConditionsResult<R>,
    ) -> ConditionsResult<R> {
        let opened = self.open_connection()?;
        let result = f(self);
        if opened {
            self.close_connection();
        }
        result
    }

    /// Registered table metadata.
    pub fn table_registry(&self) -> &Arc<TableRegistry> {
        &self.tables
    }
    /// Registered converters.
    pub fn converter_registry(&self) -> &ConverterRegistry {
        &self.converters
    }
    /// Adds or replaces the converter for the type it produces.
    pub fn register_converter(&mut self, converter: Arc<dyn ConditionsConverter>) {
        self.converters.register(converter);
    }

    /// Table metadata for `key`, falling back to a table of that name.
    pub fn find_table_meta(&self, key: &str) -> ConditionsResult<Arc<TableMetaData>> {
        self.tables
            .find_by_key(key)
            .or_else(|| self.tables.find_by_table_name(key))
            .ok_or_else(|| ConditionsError::TableNotFound(key.to_string()))
    }

    fn cached_any(
        &mut self,
        output_type: TypeId,
        output_type_name: &'static str,
        key: &str,
    ) -> ConditionsResult<CachedData> {
        let cache_key = (output_type, key.to_string());
        if let Some(data) = self.cache.get(&cache_key) {
            return Ok(data.clone());
        }
        let converter = self
            .converters
            .find(output_type)
            .ok_or_else(|| ConditionsError::ConverterNotFound(output_type_name.to_string()))?;
        let data = converter.convert(self, key)?;
        if (*data).type_id() != output_type {
            return Err(ConditionsError::TypeMismatch {
                key: key.to_string(),
                expected: output_type_name,
            });
        }
        debug!("caching conditions {key} of type {output_type_name}");
        self.cache.insert(cache_key, data.clone());
        Ok(data)
    }

    /// Conditions of type `C` for `key`, converted once and then served from the cache.
    pub fn get_cached_conditions<C: Any + Send + Sync>(
        &mut self,
        key: &str,
    ) -> ConditionsResult<Arc<C>> {
        self.cached_any(TypeId::of::<C>(), type_name::<C>(), key)?
            .downcast::<C>()
            .map_err(|_| ConditionsError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<C>(),
            })
    }

    /// Same as [`DatabaseConditionsManager::get_cached_conditions`].
    pub fn get_conditions_data<C: Any + Send + Sync>(
        &mut self,
        key: &str,
    ) -> ConditionsResult<Arc<C>> {
        self.get_cached_conditions(key)
    }

    /// The collection of `T` for the current run, looked up under the table's key.
    pub fn get_collection<T: TableBacked>(
        &mut self,
    ) -> ConditionsResult<Arc<ConditionsObjectCollection<T>>> {
        let key = self
            .tables
            .find_by_object_type(TypeId::of::<T>())
            .map_or_else(|| T::TABLE_NAME.to_string(), |meta| meta.key().to_string());
        self.get_cached_conditions(&key)
    }

    /// Every collection of `T` valid for the run under `key`. Not cached.
    pub fn get_conditions_series<T: TableBacked>(
        &mut self,
        key: &str,
    ) -> ConditionsResult<ConditionsSeries<T>> {
        ConditionsSeriesConverter::<T>::default().get_data(self, key)
    }

    /// Records for `key` that are valid for the current run and match the tag, if one is set.
    pub fn find_conditions_records(&mut self, key: &str) -> ConditionsResult<ConditionsRecordCollection> {
        let records =
            self.get_cached_conditions::<ConditionsRecordCollection>(CONDITIONS_RECORDS_TABLE)?;
        let mut found = records.find_by_key(key);
        if let Some(tag) = &self.tag {
            found.objects.retain(|record| {
                let accepted = record.tag() == Some(tag.as_str());
                if !accepted {
                    debug!(
                        "rejected record {:?} of {key} with tag {:?}",
                        record.row_id(),
                        record.tag()
                    );
                }
                accepted
            });
        }
        Ok(found)
    }

    /// Settles which records of `key` to load under `action`.
    pub fn resolve_records(
        &mut self,
        key: &str,
        action: MultipleCollectionsAction,
    ) -> ConditionsResult<Vec<ConditionsRecord>> {
        let run = self.run_number().ok_or(ConditionsError::NotInitialized)?;
        let records = self.find_conditions_records(key)?;
        action.choose(key, run, self.tag(), records.into_objects())
    }

    /// Records of every registered key for the current run. Keys that fail are logged and
    /// skipped.
    pub fn get_conditions_records(&mut self) -> ConditionsRecordCollection {
        let mut all = ConditionsRecordCollection::new();
        for key in self.tables.keys() {
            match self.find_conditions_records(&key) {
                Ok(records) => {
                    for record in records {
                        all.push(record);
                    }
                }
                Err(e) => warn!("could not find conditions records for {key}: {e}"),
            }
        }
        all
    }

    /// A collection of untyped rows for `key`, laid out by the table metadata. Not cached.
    pub fn get_raw_collection(
        &mut self,
        key: &str,
        action: MultipleCollectionsAction,
    ) -> ConditionsResult<ConditionsObjectCollection<GenericObject>> {
        self.with_connection(|manager| {
            let meta = manager.find_table_meta(key)?;
            let chosen = manager.resolve_records(key, action)?;
            read_collection(manager.connection()?, &meta, &chosen)
        })
    }

    /// Next free collection id of `table_name`.
    pub fn get_next_collection_id(&mut self, table_name: &str) -> ConditionsResult<Id> {
        let sql = build_next_collection_id(table_name)?;
        self.with_connection(|manager| {
            Ok(manager
                .connection()?
                .query_row(&sql, [], |row| row.get::<_, Id>(0))?)
        })
    }

    /// Returns true if `table_name` has rows in collection `collection_id`.
    pub fn collection_exists(&mut self, table_name: &str, collection_id: Id) -> ConditionsResult<bool> {
        let sql = build_collection_exists(table_name)?;
        self.with_connection(|manager| {
            Ok(manager
                .connection()?
                .query_row(&sql, [collection_id], |row| row.get::<_, bool>(0))?)
        })
    }

    /// Creates every registered table that does not exist yet.
    pub fn create_tables(&mut self) -> ConditionsResult<()> {
        let tables = self.tables.tables();
        self.with_connection(|manager| {
            let connection = manager.connection()?;
            for meta in &tables {
                connection.execute_batch(&build_create_table(meta)?)?;
                debug!("created table {}", meta.table_name());
            }
            Ok(())
        })
    }

    /// Inserts every row of `collection` in one transaction.
    ///
    /// Rows of grouped tables get the collection's id, or the table's next free id when the
    /// collection has none. On success the row ids and collection id are written back and any
    /// cached conditions under the table's key are dropped. On failure nothing is inserted.
    pub fn insert_collection<T: ConditionsObject>(
        &mut self,
        collection: &mut ConditionsObjectCollection<T>,
    ) -> ConditionsResult<Option<Id>> {
        let meta = match collection.table_meta() {
            Some(meta) => meta.clone(),
            None => self
                .tables
                .find_by_object_type(TypeId::of::<T>())
                .ok_or_else(|| ConditionsError::TableNotFound(type_name::<T>().to_string()))?,
        };
        if collection.is_empty() {
            return Err(ConditionsError::EmptyCollection(
                meta.table_name().to_string(),
            ));
        }
        let objects = &*collection;
        let (collection_id, row_ids) = self.with_connection(|manager| {
            let collection_id = match (meta.is_grouped(), objects.collection_id()) {
                (false, _) => None,
                (true, Some(id)) => Some(id),
                (true, None) => Some(manager.get_next_collection_id(meta.table_name())?),
            };
            let tx = manager.connection_mut()?.transaction()?;
            let mut row_ids = Vec::with_capacity(objects.len());
            for object in objects {
                let raw = object.field_values();
                if !raw.names().eq(meta.field_names()) {
                    return Err(ConditionsError::FieldSetMismatch {
                        table: meta.table_name().to_string(),
                        expected: itertools::join(meta.field_names(), ", "),
                        found: itertools::join(raw.names(), ", "),
                    });
                }
                let mut values = FieldValueMap::with_capacity(raw.len());
                for (field, value) in meta.fields().iter().zip(raw.values()) {
                    values.insert(field.name(), value.clone().coerce(field)?);
                }
                let sql = build_prepared_insert(meta.table_name(), meta.is_grouped(), &values)?;
                let mut stmt = tx.prepare_cached(&sql)?;
                let id_value = collection_id.map(FieldValue::Integer);
                stmt.execute(params_from_iter(id_value.iter().chain(values.values())))?;
                row_ids.push(tx.last_insert_rowid());
            }
            tx.commit()?;
            Ok((collection_id, row_ids))
        })?;
        for (object, row_id) in collection.objects_mut().iter_mut().zip(row_ids) {
            object.set_row_id(row_id);
        }
        if let Some(id) = collection_id {
            collection.set_collection_id(id);
        }
        if collection.table_meta().is_none() {
            collection.set_table_meta(meta.clone());
        }
        self.cache.retain(|(_, key), _| key != meta.key());
        info!(
            "inserted {} rows into {} with collection id {collection_id:?}",
            collection.len(),
            meta.table_name()
        );
        Ok(collection_id)
    }
}
