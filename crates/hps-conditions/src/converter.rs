use std::{
    any::{type_name, Any, TypeId},
    marker::PhantomData,
    sync::Arc,
};

use itertools::Itertools;
use rusqlite::{Connection, Params, Statement};
use strum::{Display, EnumIter, EnumString};
use tracing::debug;

use crate::{
    data::{
        ConditionsObject, ConditionsObjectCollection, ConditionsSeries, FieldValue, FieldValueMap,
        TableBacked,
    },
    manager::DatabaseConditionsManager,
    models::{
        ConditionsRecord, ConditionsRecordCollection, ConditionsTagCollection, TableMetaData,
        CONDITIONS_RECORDS_TABLE, CONDITIONS_TAGS_TABLE,
    },
    query::build_collection_select,
    ConditionsError, ConditionsResult, Id, RunNumber,
};

/// How a converter settles on one collection when several records are valid for a run.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MultipleCollectionsAction {
    /// More than one matching record is an error.
    Error,
    /// The most recently updated record wins.
    LastUpdated,
    /// The most recently created record wins.
    #[default]
    LastCreated,
    /// The record with the highest starting run wins.
    LatestRunStart,
    /// Every matching collection is merged into one.
    Combine,
}

impl MultipleCollectionsAction {
    /// Picks the records whose collections should be loaded.
    ///
    /// Ties between records are broken by the highest collection id and then by the highest
    /// record row id. Only [`MultipleCollectionsAction::Combine`] returns more than one record.
    pub fn choose(
        self,
        key: &str,
        run: RunNumber,
        tag: Option<&str>,
        records: Vec<ConditionsRecord>,
    ) -> ConditionsResult<Vec<ConditionsRecord>> {
        if records.is_empty() {
            return Err(ConditionsError::NoConditionsRecords {
                key: key.to_string(),
                run,
                tag: tag.map(str::to_string),
            });
        }
        if records.len() == 1 {
            return Ok(records);
        }
        let tie_break = |r: &ConditionsRecord| (r.collection_id, r.row_id.unwrap_or(Id::MIN));
        let winner = match self {
            Self::Error => {
                return Err(ConditionsError::MultipleConditionsRecords {
                    key: key.to_string(),
                    run,
                    count: records.len(),
                })
            }
            Self::Combine => return Ok(records),
            Self::LastUpdated => records
                .into_iter()
                .max_by_key(|r| (r.updated, tie_break(r))),
            Self::LastCreated => records
                .into_iter()
                .max_by_key(|r| (r.created, tie_break(r))),
            Self::LatestRunStart => records
                .into_iter()
                .max_by_key(|r| (r.run_start, tie_break(r))),
        };
        debug!(
            "{self} picked collection {:?} for {key}",
            winner.as_ref().map(ConditionsRecord::collection_id)
        );
        Ok(winner.into_iter().collect())
    }
}

/// Object-safe interface the manager uses to produce conditions of some type for a key.
pub trait ConditionsConverter: Send + Sync {
    /// [`TypeId`] of the value returned by [`ConditionsConverter::convert`].
    fn output_type(&self) -> TypeId;
    /// Name of the output type, for error messages.
    fn output_type_name(&self) -> &'static str;
    /// Produces the conditions for `key`, type-erased for the manager's cache.
    fn convert(
        &self,
        manager: &mut DatabaseConditionsManager,
        key: &str,
    ) -> ConditionsResult<Arc<dyn Any + Send + Sync>>;
}

/// Typed converter. Every implementor is also a [`ConditionsConverter`].
pub trait ConditionsDataConverter: Send + Sync {
    /// The conditions type this converter produces.
    type Output: Any + Send + Sync;
    /// Produces the conditions for `key` from the manager's database.
    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        key: &str,
    ) -> ConditionsResult<Self::Output>;
}

impl<C: ConditionsDataConverter> ConditionsConverter for C {
    fn output_type(&self) -> TypeId {
        TypeId::of::<C::Output>()
    }
    fn output_type_name(&self) -> &'static str {
        type_name::<C::Output>()
    }
    fn convert(
        &self,
        manager: &mut DatabaseConditionsManager,
        key: &str,
    ) -> ConditionsResult<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(self.get_data(manager, key)?))
    }
}

fn map_rows<T: ConditionsObject, P: Params>(
    stmt: &mut Statement<'_>,
    params: P,
    meta: &TableMetaData,
) -> ConditionsResult<Vec<T>> {
    let mut rows = stmt.query(params)?;
    let mut objects = Vec::new();
    while let Some(row) = rows.next()? {
        let row_id: Id = row.get(0)?;
        let mut values = FieldValueMap::with_capacity(meta.fields().len());
        for (i, field) in meta.fields().iter().enumerate() {
            values.insert(field.name(), FieldValue::from_sql(row.get_ref(i + 1)?, field)?);
        }
        objects.push(T::from_field_values(Some(row_id), &values)?);
    }
    Ok(objects)
}

/// Loads the rows of the collections named by `records` into one collection.
///
/// A single record stamps its record and collection id on the result. Several records, as chosen
/// by [`MultipleCollectionsAction::Combine`], give a merged collection without either.
pub(crate) fn read_collection<T: ConditionsObject>(
    connection: &Connection,
    meta: &Arc<TableMetaData>,
    records: &[ConditionsRecord],
) -> ConditionsResult<ConditionsObjectCollection<T>> {
    let ids: Vec<Id> = records
        .iter()
        .map(ConditionsRecord::collection_id)
        .unique()
        .collect();
    let sql = build_collection_select(meta, &ids)?;
    let mut stmt = connection.prepare_cached(&sql)?;
    let objects = match ids.as_slice() {
        [id] => map_rows(&mut stmt, [id], meta)?,
        _ => map_rows(&mut stmt, [], meta)?,
    };
    let mut collection = ConditionsObjectCollection::with_table_meta(meta.clone());
    if let [record] = records {
        collection.set_record(record.clone());
        collection.set_collection_id(record.collection_id());
    }
    collection.objects = objects;
    debug!(
        "loaded {} rows of {} from collections {:?}",
        collection.len(),
        meta.table_name(),
        ids
    );
    Ok(collection)
}

/// The collection of `T`, or `None` when no record covers the run.
pub(crate) fn optional_collection<T: TableBacked>(
    manager: &mut DatabaseConditionsManager,
) -> ConditionsResult<Option<Arc<ConditionsObjectCollection<T>>>> {
    match manager.get_collection::<T>() {
        Ok(collection) => Ok(Some(collection)),
        Err(ConditionsError::NoConditionsRecords { key, .. }) => {
            debug!("no {key} conditions for this run");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Generic converter that resolves one collection of `T` per key.
pub struct ConditionsObjectConverter<T> {
    action: MultipleCollectionsAction,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ConditionsObjectConverter<T> {
    /// A converter that settles multiple valid collections with `action`.
    pub fn new(action: MultipleCollectionsAction) -> Self {
        Self {
            action,
            _marker: PhantomData,
        }
    }
    /// The multiple collections action in use.
    pub fn action(&self) -> MultipleCollectionsAction {
        self.action
    }
}

impl<T: TableBacked> Default for ConditionsObjectConverter<T> {
    fn default() -> Self {
        Self::new(T::multiple_collections())
    }
}

impl<T: TableBacked> ConditionsDataConverter for ConditionsObjectConverter<T> {
    type Output = ConditionsObjectCollection<T>;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        key: &str,
    ) -> ConditionsResult<Self::Output> {
        let action = self.action;
        manager.with_connection(|manager| {
            let meta = manager.find_table_meta(key)?;
            if meta.object_type() != TypeId::of::<T>() {
                return Err(ConditionsError::TypeMismatch {
                    key: key.to_string(),
                    expected: type_name::<T>(),
                });
            }
            let chosen = manager.resolve_records(key, action)?;
            read_collection(manager.connection()?, &meta, &chosen)
        })
    }
}

/// Resolves every collection valid for the run, one per record. Never fails on zero records.
pub struct ConditionsSeriesConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ConditionsSeriesConverter<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: TableBacked> ConditionsDataConverter for ConditionsSeriesConverter<T> {
    type Output = ConditionsSeries<T>;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        key: &str,
    ) -> ConditionsResult<Self::Output> {
        manager.with_connection(|manager| {
            let meta = manager.find_table_meta(key)?;
            if meta.object_type() != TypeId::of::<T>() {
                return Err(ConditionsError::TypeMismatch {
                    key: key.to_string(),
                    expected: type_name::<T>(),
                });
            }
            let records = manager.find_conditions_records(key)?;
            let mut series = ConditionsSeries::new();
            for record in records {
                series.push(read_collection(
                    manager.connection()?,
                    &meta,
                    std::slice::from_ref(&record),
                )?);
            }
            Ok(series)
        })
    }
}

/// Reads every conditions record whose run range covers the manager's run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionsRecordConverter;

impl ConditionsDataConverter for ConditionsRecordConverter {
    type Output = ConditionsRecordCollection;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        _key: &str,
    ) -> ConditionsResult<Self::Output> {
        manager.with_connection(|manager| {
            let run = manager.run_number().ok_or(ConditionsError::NotInitialized)?;
            let meta = manager.find_table_meta(CONDITIONS_RECORDS_TABLE)?;
            let sql = format!(
                "SELECT id, {} FROM {} WHERE run_start <= ?1 AND run_end >= ?1 ORDER BY id",
                meta.field_names().join(", "),
                meta.table_name()
            );
            let mut stmt = manager.connection()?.prepare_cached(&sql)?;
            let mut records = ConditionsRecordCollection::with_table_meta(meta.clone());
            records.objects = map_rows(&mut stmt, [run], &meta)?;
            debug!("found {} conditions records for run {run}", records.len());
            Ok(records)
        })
    }
}

/// Reads the membership of the manager's tag. Without a tag the result is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionsTagConverter;

impl ConditionsDataConverter for ConditionsTagConverter {
    type Output = ConditionsTagCollection;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        _key: &str,
    ) -> ConditionsResult<Self::Output> {
        let meta = manager.find_table_meta(CONDITIONS_TAGS_TABLE)?;
        let mut tags = ConditionsTagCollection::with_table_meta(meta.clone());
        let Some(tag) = manager.tag().map(str::to_string) else {
            return Ok(tags);
        };
        manager.with_connection(|manager| {
            let sql = format!(
                "SELECT id, {} FROM {} WHERE tag = ?1 ORDER BY conditions_id, id",
                meta.field_names().join(", "),
                meta.table_name()
            );
            let mut stmt = manager.connection()?.prepare_cached(&sql)?;
            tags.objects = map_rows(&mut stmt, [&tag], &meta)?;
            Ok(tags)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(collection_id: Id, row_id: Id, day: u32, run_start: RunNumber) -> ConditionsRecord {
        let mut record = ConditionsRecord::new("ecal_gains", "ecal_gains", collection_id, run_start, 9999)
            .with_created(Utc.with_ymd_and_hms(2015, 1, day, 0, 0, 0).unwrap())
            .with_updated(Utc.with_ymd_and_hms(2015, 2, 29 - day, 0, 0, 0).unwrap());
        record.row_id = Some(row_id);
        record
    }

    fn chosen(action: MultipleCollectionsAction, records: Vec<ConditionsRecord>) -> Vec<Id> {
        action
            .choose("ecal_gains", 1000, None, records)
            .unwrap()
            .iter()
            .map(ConditionsRecord::collection_id)
            .collect()
    }

    #[test]
    fn each_policy_picks_its_maximum() {
        let records = vec![record(1, 1, 1, 500), record(2, 2, 2, 100), record(3, 3, 3, 300)];
        assert_eq!(chosen(MultipleCollectionsAction::LastCreated, records.clone()), vec![3]);
        assert_eq!(chosen(MultipleCollectionsAction::LastUpdated, records.clone()), vec![1]);
        assert_eq!(chosen(MultipleCollectionsAction::LatestRunStart, records.clone()), vec![1]);
        assert_eq!(chosen(MultipleCollectionsAction::Combine, records), vec![1, 2, 3]);
    }

    #[test]
    fn ties_prefer_highest_collection_then_row_id() {
        let records = vec![record(4, 1, 1, 100), record(7, 2, 1, 100), record(7, 1, 1, 100)];
        let winner = MultipleCollectionsAction::LastCreated
            .choose("ecal_gains", 1000, None, records)
            .unwrap();
        assert_eq!(winner.len(), 1);
        assert_eq!(winner[0].collection_id(), 7);
        assert_eq!(winner[0].row_id(), Some(2));
    }

    #[test]
    fn error_policy_rejects_multiple_records() {
        let err = MultipleCollectionsAction::Error
            .choose("ecal_gains", 1000, None, vec![record(1, 1, 1, 1), record(2, 2, 2, 1)])
            .unwrap_err();
        assert!(matches!(
            err,
            ConditionsError::MultipleConditionsRecords { count: 2, .. }
        ));
        assert_eq!(
            chosen(MultipleCollectionsAction::Error, vec![record(5, 1, 1, 1)]),
            vec![5]
        );
    }

    #[test]
    fn zero_records_is_an_error_for_every_policy() {
        for action in <MultipleCollectionsAction as strum::IntoEnumIterator>::iter() {
            let err = action
                .choose("ecal_gains", 1000, Some("pass1"), Vec::new())
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                "no conditions records found for key ecal_gains at run 1000 with tag pass1"
            );
        }
    }

    #[test]
    fn policies_parse_from_snake_case() {
        assert_eq!(
            "latest_run_start".parse::<MultipleCollectionsAction>().unwrap(),
            MultipleCollectionsAction::LatestRunStart
        );
        assert_eq!(MultipleCollectionsAction::LastCreated.to_string(), "last_created");
    }
}
