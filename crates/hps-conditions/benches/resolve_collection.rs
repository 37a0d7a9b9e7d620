//! Benchmarks of conditions resolution and cached lookup.

use std::{hint::black_box, time::Duration};

use criterion::{criterion_group, criterion_main, Criterion};
use hps_conditions::{ecal::EcalGain, prelude::*};
use tempfile::TempDir;

const N_CHANNELS: i64 = 442;
const N_COLLECTIONS: i64 = 20;

/// A database with `N_COLLECTIONS` overlapping ECal gain sets, all valid for run 5772.
fn setup_manager() -> (TempDir, DatabaseConditionsManager) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("bench.sqlite");
    std::fs::File::create(&path).expect("failed to create database");
    let mut manager = DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(&path))
        .expect("failed to create manager");
    manager.create_tables().expect("failed to create tables");
    for i in 0..N_COLLECTIONS {
        let mut gains = ConditionsObjectCollection::new();
        for channel in 1..=N_CHANNELS {
            gains
                .add(EcalGain::new(channel, 0.1 + i as f64 * 0.01))
                .expect("failed to add gain");
        }
        let collection_id = manager
            .insert_collection(&mut gains)
            .expect("failed to insert gains")
            .expect("missing collection id");
        let mut records = ConditionsRecordCollection::new();
        records
            .add(ConditionsRecord::new("ecal_gains", "ecal_gains", collection_id, 5000 + i, 9999))
            .expect("failed to add record");
        manager
            .insert_collection(&mut records)
            .expect("failed to insert record");
    }
    manager
        .set_detector("HPS-EngRun2015-Nominal-v3", 5772)
        .expect("failed to initialize");
    (dir, manager)
}

fn bench_resolve_ecal_gains(c: &mut Criterion) {
    let (_dir, mut manager) = setup_manager();
    let mut group = c.benchmark_group("resolve_ecal_gains");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));
    for action in [
        MultipleCollectionsAction::LastCreated,
        MultipleCollectionsAction::LatestRunStart,
        MultipleCollectionsAction::Combine,
    ] {
        group.bench_function(action.to_string(), |b| {
            b.iter(|| {
                let data = manager
                    .get_raw_collection("ecal_gains", black_box(action))
                    .expect("resolve failed");
                black_box(&data);
            })
        });
    }
    group.finish();
}

fn bench_cached_collection(c: &mut Criterion) {
    let (_dir, mut manager) = setup_manager();
    manager.get_collection::<EcalGain>().expect("resolve failed");
    c.bench_function("cached_ecal_gains", |b| {
        b.iter(|| {
            let data = manager.get_collection::<EcalGain>().expect("cache lookup failed");
            black_box(&data);
        })
    });
}

criterion_group!(benches, bench_resolve_ecal_gains, bench_cached_collection);
criterion_main!(benches);
