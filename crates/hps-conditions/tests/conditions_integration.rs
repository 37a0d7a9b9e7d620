use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{TimeZone, Utc};
use hps_conditions::{
    config::ConfigResource,
    connection::{ConnectionParameters, RetryPolicy},
    data::GenericObject,
    ecal::{EcalBadChannel, EcalCalibration, EcalChannel, EcalConditions, EcalGain, ECAL_CONDITIONS_KEY},
    prelude::*,
    setup::EcalDetectorSetup,
    svt::{SvtChannel, SvtConditions, SvtGain, SVT_CONDITIONS_KEY},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const DETECTOR: &str = "HPS-EngRun2015-Nominal-v3";

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("conditions.sqlite")
}

fn open_manager() -> ConditionsResult<(TempDir, DatabaseConditionsManager)> {
    let dir = TempDir::new()?;
    let path = db_path(&dir);
    fs::File::create(&path)?;
    let mut manager = DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(&path))?;
    manager.create_tables()?;
    Ok((dir, manager))
}

fn add_collection<T: ConditionsObject>(
    manager: &mut DatabaseConditionsManager,
    objects: Vec<T>,
) -> ConditionsResult<Id> {
    let mut collection = ConditionsObjectCollection::new();
    for object in objects {
        collection.add(object)?;
    }
    Ok(manager
        .insert_collection(&mut collection)?
        .expect("grouped tables get a collection id"))
}

fn add_record(
    manager: &mut DatabaseConditionsManager,
    record: ConditionsRecord,
) -> ConditionsResult<ConditionsRecord> {
    let mut records = ConditionsRecordCollection::new();
    records.add(record)?;
    manager.insert_collection(&mut records)?;
    Ok(records.into_objects().remove(0))
}

fn record(key: &str, collection_id: Id, run_start: RunNumber, run_end: RunNumber, day: u32) -> ConditionsRecord {
    ConditionsRecord::new(key, key, collection_id, run_start, run_end)
        .with_created(Utc.with_ymd_and_hms(2015, 3, day, 12, 0, 0).unwrap())
        .with_updated(Utc.with_ymd_and_hms(2015, 3, day, 12, 0, 0).unwrap())
}

/// Two overlapping gain sets for runs around 5772:
/// collection 1 (gain 1.0) starts later but was created first and updated last,
/// collection 2 (gain 2.0) starts earlier and was created last.
fn overlapping_gains(manager: &mut DatabaseConditionsManager) -> ConditionsResult<()> {
    let first = add_collection(manager, vec![EcalGain::new(1, 1.0), EcalGain::new(2, 1.0)])?;
    let second = add_collection(manager, vec![EcalGain::new(1, 2.0), EcalGain::new(2, 2.0)])?;
    assert_eq!((first, second), (1, 2));
    add_record(
        manager,
        record("ecal_gains", first, 5700, 6000, 1)
            .with_updated(Utc.with_ymd_and_hms(2015, 4, 1, 0, 0, 0).unwrap()),
    )?;
    add_record(manager, record("ecal_gains", second, 5000, 6000, 2))?;
    Ok(())
}

fn gains(collection: &ConditionsObjectCollection<GenericObject>) -> Vec<FieldValue> {
    collection
        .iter()
        .filter_map(|row| row.get("gain").cloned())
        .collect()
}

#[test]
fn last_created_collection_wins_by_default() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;
    let collection = manager.get_collection::<EcalGain>()?;
    assert_eq!(collection.collection_id(), Some(2));
    assert_eq!(collection.len(), 2);
    assert!(collection.iter().all(|gain| gain.gain() == 2.0));
    assert_eq!(collection.record().map(ConditionsRecord::collection_id), Some(2));
    Ok(())
}

#[test]
fn multiple_collection_actions() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;

    let latest_start = manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::LatestRunStart)?;
    assert_eq!(latest_start.collection_id(), Some(1));
    assert_eq!(gains(&latest_start), vec![FieldValue::Real(1.0); 2]);

    let last_updated = manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::LastUpdated)?;
    assert_eq!(last_updated.collection_id(), Some(1));

    let combined = manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::Combine)?;
    assert_eq!(combined.len(), 4);
    assert_eq!(combined.collection_id(), None);

    let err = manager
        .get_raw_collection("ecal_gains", MultipleCollectionsAction::Error)
        .unwrap_err();
    assert!(matches!(
        err,
        ConditionsError::MultipleConditionsRecords { count: 2, run: 5772, .. }
    ));
    Ok(())
}

#[test]
fn only_covering_records_are_used() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    // Run 5500 is only covered by collection 2.
    manager.set_detector(DETECTOR, 5500)?;
    let collection = manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::Error)?;
    assert_eq!(collection.collection_id(), Some(2));
    Ok(())
}

#[test]
fn no_records_for_run() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 7000)?;
    let err = manager.get_collection::<EcalGain>().unwrap_err();
    assert!(matches!(
        err,
        ConditionsError::NoConditionsRecords { ref key, run: 7000, tag: None } if key == "ecal_gains"
    ));
    let series = manager.get_conditions_series::<EcalGain>("ecal_gains")?;
    assert!(series.is_empty());
    Ok(())
}

#[test]
fn series_has_one_collection_per_record() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;
    let series = manager.get_conditions_series::<EcalGain>("ecal_gains")?;
    let ids: Vec<_> = series.iter().map(ConditionsObjectCollection::collection_id).collect();
    assert_eq!(ids, vec![Some(1), Some(2)]);
    Ok(())
}

#[test]
fn series_checks_the_object_type() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let channels = add_collection(&mut manager, vec![SvtChannel::new(1, 0, 0, 0)])?;
    let svt_gains = add_collection(&mut manager, vec![SvtGain::new(1, 1.0, 0.0)])?;
    add_record(&mut manager, record("svt_channels", channels, 0, 9999, 1))?;
    add_record(&mut manager, record("svt_gains", svt_gains, 0, 9999, 1))?;
    manager.set_detector(DETECTOR, 5772)?;
    let err = manager.get_conditions_series::<EcalGain>("svt_gains").unwrap_err();
    assert!(matches!(err, ConditionsError::TypeMismatch { ref key, .. } if key == "svt_gains"));
    assert_eq!(manager.get_conditions_series::<SvtGain>("svt_gains")?.len(), 1);
    Ok(())
}

#[test]
fn conditions_are_unavailable_before_initialization() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    let err = manager.get_collection::<EcalGain>().unwrap_err();
    assert!(matches!(err, ConditionsError::NotInitialized));
    Ok(())
}

#[test]
fn insert_writes_back_ids() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let mut collection = ConditionsObjectCollection::new();
    collection.add(EcalCalibration::new(1, 100.5, 1.5))?;
    collection.add(EcalCalibration::new(2, 101.0, 1.25))?;
    let id = manager.insert_collection(&mut collection)?;
    assert_eq!(id, Some(1));
    assert_eq!(collection.collection_id(), Some(1));
    let row_ids: Vec<_> = collection.iter().map(ConditionsObject::row_id).collect();
    assert_eq!(row_ids, vec![Some(1), Some(2)]);

    assert_eq!(manager.get_next_collection_id("ecal_calibrations")?, 2);
    assert!(manager.collection_exists("ecal_calibrations", 1)?);
    assert!(!manager.collection_exists("ecal_calibrations", 2)?);
    assert_eq!(manager.get_next_collection_id("ecal_gains")?, 1);

    add_record(&mut manager, record("ecal_calibrations", 1, 0, 9999, 5))?;
    manager.set_detector(DETECTOR, 5772)?;
    let loaded = manager.get_collection::<EcalCalibration>()?;
    assert_eq!(loaded.objects(), collection.objects());
    Ok(())
}

fn gain_row(channel_id: i64, gain: impl Into<FieldValue>) -> GenericObject {
    let mut values = FieldValueMap::new();
    values.insert("channel_id", channel_id);
    values.insert("gain", gain);
    GenericObject::new(values)
}

#[test]
fn bad_row_rolls_back_the_whole_insert() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let meta = manager.find_table_meta("ecal_gains")?;
    let mut collection = ConditionsObjectCollection::new();
    collection.add(gain_row(1, 0.5))?;
    let mut wrong_fields = FieldValueMap::new();
    wrong_fields.insert("channel_id", 2);
    wrong_fields.insert("pedestal", 0.5);
    collection.add(GenericObject::new(wrong_fields))?;
    collection.set_table_meta(meta);

    let err = manager.insert_collection(&mut collection).unwrap_err();
    assert!(matches!(err, ConditionsError::FieldSetMismatch { .. }));
    assert!(!manager.collection_exists("ecal_gains", 1)?);
    assert_eq!(collection.collection_id(), None);
    assert!(collection.iter().all(|row| row.row_id().is_none()));
    Ok(())
}

#[test]
fn insert_checks_values_against_field_types() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let meta = manager.find_table_meta("ecal_gains")?;
    let mut collection = ConditionsObjectCollection::with_table_meta(meta);
    collection.add(gain_row(1, 0.5))?;
    collection.add(gain_row(2, "not a number"))?;
    let err = manager.insert_collection(&mut collection).unwrap_err();
    assert!(matches!(err, ConditionsError::FieldMapping { ref field, .. } if field == "gain"));
    assert!(!manager.collection_exists("ecal_gains", 1)?);

    let mut widened = ConditionsObjectCollection::with_table_meta(manager.find_table_meta("ecal_gains")?);
    widened.add(gain_row(1, 2))?;
    let id = manager.insert_collection(&mut widened)?;
    add_record(&mut manager, record("ecal_gains", id.unwrap_or_default(), 0, 9999, 1))?;
    manager.set_detector(DETECTOR, 5772)?;
    let gains = manager.get_collection::<EcalGain>()?;
    assert_eq!(gains.iter().map(EcalGain::gain).collect::<Vec<_>>(), vec![2.0]);
    Ok(())
}

#[test]
fn empty_collection_is_rejected() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let mut collection = ConditionsObjectCollection::<EcalGain>::new();
    let err = manager.insert_collection(&mut collection).unwrap_err();
    assert!(matches!(err, ConditionsError::EmptyCollection(_)));
    Ok(())
}

#[test]
fn records_keep_their_fields() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let inserted = add_record(
        &mut manager,
        record("svt_gains", 1, 5000, 6000, 3)
            .with_tag("pass1")
            .with_created_by("hps")
            .with_notes("first pass"),
    )?;
    manager.set_detector(DETECTOR, 5772)?;
    let records = manager.find_conditions_records("svt_gains")?;
    assert_eq!(records.objects(), &[inserted]);
    Ok(())
}

#[test]
fn tag_restricts_records() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let tagged = add_collection(&mut manager, vec![EcalGain::new(1, 0.5)])?;
    let untagged = add_collection(&mut manager, vec![EcalGain::new(1, 0.75)])?;
    add_record(&mut manager, record("ecal_gains", tagged, 0, 9999, 1).with_tag("pass1"))?;
    add_record(&mut manager, record("ecal_gains", untagged, 0, 9999, 2))?;

    manager.set_tag(Some("pass1"));
    manager.set_detector(DETECTOR, 5772)?;
    assert_eq!(manager.get_collection::<EcalGain>()?.collection_id(), Some(tagged));

    manager.set_tag(None);
    assert_eq!(manager.get_collection::<EcalGain>()?.collection_id(), Some(untagged));

    manager.set_tag(Some("pass2"));
    let err = manager.get_collection::<EcalGain>().unwrap_err();
    assert!(matches!(
        err,
        ConditionsError::NoConditionsRecords { tag: Some(ref tag), .. } if tag == "pass2"
    ));
    Ok(())
}

#[test]
fn converter_leaves_caller_connection_open() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;
    assert!(!manager.is_connected());

    manager.get_collection::<EcalGain>()?;
    assert!(!manager.is_connected());

    assert!(manager.open_connection()?);
    assert!(!manager.open_connection()?);
    manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::LastCreated)?;
    assert!(manager.is_connected());
    manager.close_connection();
    assert!(!manager.is_connected());
    Ok(())
}

#[test]
fn freeze_ignores_run_changes() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    manager.configure_resource(ConfigResource::Production)?;
    manager.settings_mut().freeze_after_initialize = true;
    manager.set_detector(DETECTOR, 5772)?;
    assert!(manager.is_frozen());

    manager.set_detector(DETECTOR, 5800)?;
    assert_eq!(manager.run_number(), Some(5772));

    manager.unfreeze();
    assert_eq!(
        manager.state(),
        &ManagerState::Initialized {
            detector: DETECTOR.to_string(),
            run: 5772
        }
    );
    manager.set_detector(DETECTOR, 5800)?;
    assert_eq!(manager.run_number(), Some(5800));
    Ok(())
}

#[test]
fn first_configuration_wins() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    manager.configure_resource(ConfigResource::TestRun2012)?;
    manager.configure_resource(ConfigResource::EngRun)?;
    assert!(manager.settings().is_test_run);
    Ok(())
}

fn ecal_tables(manager: &mut DatabaseConditionsManager) -> ConditionsResult<()> {
    let channels = add_collection(
        manager,
        vec![
            EcalChannel::new(1, -23, 1, 1, 10, 0),
            EcalChannel::new(2, -22, 1, 1, 10, 1),
            EcalChannel::new(3, -21, 1, 1, 10, 2),
        ],
    )?;
    let gains = add_collection(manager, vec![EcalGain::new(1, 0.15), EcalGain::new(2, 0.2)])?;
    let calibrations = add_collection(manager, vec![EcalCalibration::new(1, 98.0, 2.5)])?;
    let bad_a = add_collection(manager, vec![EcalBadChannel::new(2)])?;
    let bad_b = add_collection(manager, vec![EcalBadChannel::new(3)])?;
    add_record(manager, record("ecal_channels", channels, 0, 9999, 1))?;
    add_record(manager, record("ecal_gains", gains, 0, 9999, 1))?;
    add_record(manager, record("ecal_calibrations", calibrations, 0, 9999, 1))?;
    add_record(manager, record("ecal_bad_channels", bad_a, 0, 9999, 1))?;
    add_record(manager, record("ecal_bad_channels", bad_b, 0, 9999, 2))?;
    Ok(())
}

#[test]
fn ecal_conditions_join_tables() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    ecal_tables(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;
    let ecal = manager.get_cached_conditions::<EcalConditions>(ECAL_CONDITIONS_KEY)?;
    assert_eq!(ecal.len(), 3);

    let first = ecal.get(1).unwrap();
    assert_eq!(first.gain, Some(0.15));
    assert_eq!(first.pedestal, Some(98.0));
    assert_eq!(first.noise, Some(2.5));
    assert!(!first.bad);

    let third = ecal.find_by_position(-21, 1).unwrap();
    assert_eq!(third.channel.channel_id(), 3);
    assert_eq!(third.gain, None);

    let bad: Vec<_> = ecal.bad_channels().map(|c| c.channel.channel_id()).collect();
    assert_eq!(bad, vec![2, 3]);

    let again = manager.get_cached_conditions::<EcalConditions>(ECAL_CONDITIONS_KEY)?;
    assert!(Arc::ptr_eq(&ecal, &again));
    Ok(())
}

#[test]
fn test_run_ignores_bad_channels() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    ecal_tables(&mut manager)?;
    manager.set_detector("HPS-TestRun-v8-5", 1351)?;
    assert!(manager.settings().is_test_run);
    let ecal = manager.get_cached_conditions::<EcalConditions>(ECAL_CONDITIONS_KEY)?;
    assert_eq!(ecal.bad_channels().count(), 0);
    Ok(())
}

#[test]
fn svt_conditions_without_gains() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let channels = add_collection(
        &mut manager,
        vec![SvtChannel::new(1, 2, 0, 0), SvtChannel::new(2, 2, 0, 1)],
    )?;
    add_record(&mut manager, record("svt_channels", channels, 0, 9999, 1))?;
    manager.set_detector(DETECTOR, 5772)?;
    let svt = manager.get_cached_conditions::<SvtConditions>(SVT_CONDITIONS_KEY)?;
    assert_eq!(svt.len(), 2);
    assert_eq!(svt.find_by_address(2, 0, 1).map(|c| c.channel.channel_id()), Some(2));
    assert!(svt.channels().all(|c| c.gain.is_none()));

    let gains = add_collection(&mut manager, vec![SvtGain::new(1, 1.1, 0.2)])?;
    add_record(&mut manager, record("svt_gains", gains, 0, 9999, 2))?;
    let gains = manager.get_collection::<SvtGain>()?;
    assert_eq!(gains.get(0).map(SvtGain::offset), Some(0.2));
    Ok(())
}

#[test]
fn failing_detector_setup_is_not_fatal() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    manager.add_detector_setup(Box::new(EcalDetectorSetup::new(move |name, ecal| {
        sink.lock().unwrap().push((name.to_string(), ecal.len()));
    })));

    // No channel map yet, so the setup fails and is skipped.
    manager.set_detector(DETECTOR, 5772)?;
    assert!(manager.is_initialized());
    assert!(received.lock().unwrap().is_empty());

    ecal_tables(&mut manager)?;
    manager.set_detector(DETECTOR, 5773)?;
    assert_eq!(*received.lock().unwrap(), vec![("Ecal".to_string(), 3)]);
    Ok(())
}

#[test]
fn disabled_setup_is_skipped() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    ecal_tables(&mut manager)?;
    manager.configure_resource(ConfigResource::Production)?;
    manager.settings_mut().setup_ecal_detector = false;
    let calls = Arc::new(Mutex::new(0));
    let sink = calls.clone();
    manager.add_detector_setup(Box::new(EcalDetectorSetup::new(move |_, _| {
        *sink.lock().unwrap() += 1;
    })));
    manager.set_detector(DETECTOR, 5772)?;
    assert_eq!(*calls.lock().unwrap(), 0);
    Ok(())
}

#[test]
fn raw_collection_follows_metadata() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.set_detector(DETECTOR, 5772)?;
    let raw = manager.get_raw_collection("ecal_gains", MultipleCollectionsAction::LastCreated)?;
    let first = raw.get(0).unwrap();
    assert_eq!(
        first.values().names().collect::<Vec<_>>(),
        vec!["channel_id", "gain"]
    );
    assert_eq!(first.get("channel_id"), Some(&FieldValue::Integer(1)));
    assert_eq!(first.get("gain"), Some(&FieldValue::Real(2.0)));

    let err = manager
        .get_raw_collection("hodo_gains", MultipleCollectionsAction::LastCreated)
        .unwrap_err();
    assert!(matches!(err, ConditionsError::TableNotFound(_)));
    Ok(())
}

#[test]
fn cache_all_conditions_skips_failures() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    overlapping_gains(&mut manager)?;
    manager.configure_resource(ConfigResource::Production)?;
    manager.settings_mut().cache_all_conditions = true;
    manager.set_detector(DETECTOR, 5772)?;
    assert_eq!(manager.get_collection::<EcalGain>()?.collection_id(), Some(2));
    Ok(())
}

#[test]
fn connection_retries_are_bounded() {
    let dir = TempDir::new().unwrap();
    let missing: &Path = &dir.path().join("missing").join("conditions.sqlite");
    let policy = RetryPolicy {
        max_attempts: 4,
        backoff_step: Duration::from_millis(1),
    };
    let mut waits = Vec::new();
    let err = ConnectionParameters::sqlite(missing)
        .create_connection_with(&policy, Duration::from_millis(10), |wait| waits.push(wait))
        .unwrap_err();
    assert!(matches!(err, ConditionsError::ConnectionFailed { attempts: 4, .. }));
    assert_eq!(
        waits,
        vec![
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(3)
        ]
    );
}

#[test]
fn failed_initialization_leaves_manager_uninitialized() -> ConditionsResult<()> {
    let dir = TempDir::new()?;
    let mut manager = DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(
        dir.path().join("missing").join("conditions.sqlite"),
    ))?;
    manager.set_retry_policy(RetryPolicy {
        max_attempts: 1,
        backoff_step: Duration::from_millis(1),
    });
    let err = manager.set_detector(DETECTOR, 5772).unwrap_err();
    assert!(matches!(err, ConditionsError::ConnectionFailed { attempts: 1, .. }));
    assert_eq!(manager.state(), &ManagerState::Uninitialized);
    Ok(())
}

#[test]
fn failed_record_load_closes_the_connection() -> ConditionsResult<()> {
    let dir = TempDir::new()?;
    let path = db_path(&dir);
    fs::File::create(&path)?;
    let mut manager = DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(&path))?;
    assert!(manager.set_detector(DETECTOR, 5772).is_err());
    assert!(!manager.is_connected());
    assert_eq!(manager.state(), &ManagerState::Uninitialized);
    Ok(())
}

#[test]
fn run_zero_is_not_auto_configured() -> ConditionsResult<()> {
    let (_dir, mut manager) = open_manager()?;
    manager.set_detector(DETECTOR, 0)?;
    assert!(!manager.is_configured());
    manager.set_detector(DETECTOR, 1351)?;
    assert!(manager.is_configured());
    assert!(manager.settings().is_test_run);
    Ok(())
}

#[test]
fn cli_loads_and_prints() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = db_path(&dir);
    let database: &str = path.to_str().unwrap();
    hps_conditions::cli::run_with_args(["hps-conditions", "--database", database, "init"])?;

    let rows = dir.path().join("gains.json");
    fs::write(
        &rows,
        r#"[{"channel_id": 1, "gain": 0.25}, {"channel_id": 2, "gain": 1}]"#,
    )?;
    hps_conditions::cli::run_with_args([
        "hps-conditions",
        "--database",
        database,
        "--tag",
        "pass1",
        "load",
        "--key",
        "ecal_gains",
        "--run-start",
        "5000",
        "--run-end",
        "6000",
        "--notes",
        "loaded from json",
        rows.to_str().unwrap(),
    ])?;
    hps_conditions::cli::run_with_args([
        "hps-conditions",
        "--database",
        database,
        "print",
        "ecal_gains:5772:pass1",
    ])?;

    let mut manager = DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(&path))?;
    manager.set_tag(Some("pass1"));
    manager.set_detector(DETECTOR, 5772)?;
    let gains = manager.get_collection::<EcalGain>()?;
    let values: Vec<_> = gains.iter().map(|g| (g.channel_id(), g.gain())).collect();
    assert_eq!(values, vec![(1, 0.25), (2, 1.0)]);
    let record = gains.record().unwrap();
    assert_eq!(record.notes(), Some("loaded from json"));
    assert_eq!(record.tag(), Some("pass1"));
    Ok(())
}
