//! End-to-end tests of the storage engine: write path, restart and crash
//! recovery through commit log replay.

use horizondb_engine::model::{
    Field, FieldType, PartitionGranularity, Record, RecordTypeDefinition, TimeUnit,
};
use horizondb_engine::{
    DatabaseDefinition, EngineConfig, Error, Result, StorageEngine, SyncMode, TimeRange,
    TimeSeriesDefinition,
};
use std::time::Duration;
use tempfile::TempDir;

const HOUR_MS: i64 = 3_600_000;

fn config(temp_dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(temp_dir.path())
        .with_block_size(1024)
        .with_branching_factor(8)
        .with_mem_series_max_size(256)
        .with_slab_size(4096)
        .with_shutdown_wait(Duration::from_secs(10));
    config.commit_log.sync_mode = SyncMode::Batch;
    config.commit_log.segment_size = 16 * 1024;
    config
}

fn definition() -> TimeSeriesDefinition {
    TimeSeriesDefinition::new("metrics", "cpu")
        .with_time_unit(TimeUnit::Milliseconds)
        .with_granularity(PartitionGranularity::Hourly)
        .with_record_type(RecordTypeDefinition::new("load").with_field("value", FieldType::Long))
}

fn start(temp_dir: &TempDir) -> StorageEngine {
    StorageEngine::start(config(temp_dir)).unwrap()
}

fn create_schema(engine: &StorageEngine) {
    engine
        .create_database(DatabaseDefinition::new("metrics"), true)
        .unwrap();
    engine.create_time_series(definition(), true).unwrap();
}

fn load(timestamp: i64, value: i64) -> Record {
    Record::new(0, vec![Field::Timestamp(timestamp), Field::Long(value)])
}

/// Writes `count` records, one per second from `start`, one write per record.
fn write_series(engine: &StorageEngine, start: i64, count: i64) -> Vec<Record> {
    let records: Vec<Record> = (0..count)
        .map(|i| load(start + i * 1_000, i * 3 - 50))
        .collect();
    let mut last = None;
    for record in &records {
        let timestamp = record.timestamp().unwrap();
        last = Some(engine.write("metrics", "cpu", timestamp, std::slice::from_ref(record)).unwrap());
    }
    if let Some(future) = last {
        future.wait().unwrap();
    }
    records
}

fn read(engine: &StorageEngine, range: TimeRange) -> Vec<Record> {
    engine
        .read("metrics", "cpu", range)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap()
}

/// Simulates a crash once background flushes are done: buffered data is not
/// flushed and the commit log is not closed.
fn crash(engine: StorageEngine) {
    engine
        .flush_manager()
        .drain(Duration::from_secs(10))
        .unwrap();
    std::mem::forget(engine);
}

#[test]
fn test_reads_span_partitions() {
    let temp_dir = TempDir::new().unwrap();
    let engine = start(&temp_dir);
    create_schema(&engine);

    let mut records = write_series(&engine, HOUR_MS - 5_000, 10);
    records.extend(write_series(&engine, 3 * HOUR_MS, 3));
    assert_eq!(read(&engine, TimeRange::all()), records);

    let window = TimeRange::new(HOUR_MS - 2_000, HOUR_MS + 2_000);
    let expected: Vec<Record> = records
        .iter()
        .filter(|r| window.contains(r.timestamp().unwrap()))
        .cloned()
        .collect();
    assert_eq!(expected.len(), 4);
    assert_eq!(read(&engine, window), expected);
    assert!(read(&engine, TimeRange::new(10 * HOUR_MS, 11 * HOUR_MS)).is_empty());
}

#[test]
fn test_catalog_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = start(&temp_dir);
        create_schema(&engine);
        engine
            .create_database(DatabaseDefinition::new("logs"), true)
            .unwrap();
        engine.shutdown().unwrap();
    }
    let engine = start(&temp_dir);
    let names: Vec<String> = engine
        .list_databases()
        .unwrap()
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    assert_eq!(names, vec!["logs", "metrics"]);
    assert_eq!(*engine.get_time_series("metrics", "cpu").unwrap(), definition());
    assert!(matches!(
        engine.create_time_series(definition(), true),
        Err(Error::DuplicateTimeSeries { .. })
    ));
}

#[test]
fn test_clean_shutdown_keeps_every_record_once() {
    let temp_dir = TempDir::new().unwrap();
    let records = {
        let engine = start(&temp_dir);
        create_schema(&engine);
        let records = write_series(&engine, 0, 200);
        engine.shutdown().unwrap();
        records
    };
    let engine = start(&temp_dir);
    assert_eq!(read(&engine, TimeRange::all()), records);
    assert_eq!(engine.memory_usage(), 0);
}

#[test]
fn test_crash_recovery_replays_unflushed_writes() {
    let temp_dir = TempDir::new().unwrap();
    let records = {
        let engine = start(&temp_dir);
        create_schema(&engine);
        let records = write_series(&engine, 0, 40);
        crash(engine);
        records
    };
    let engine = start(&temp_dir);
    assert_eq!(read(&engine, TimeRange::all()), records);

    // The replayed state continues the delta chain.
    let more = write_series(&engine, 40_000, 5);
    let mut expected = records;
    expected.extend(more);
    assert_eq!(read(&engine, TimeRange::all()), expected);
}

#[test]
fn test_crash_after_partial_flush_applies_each_write_once() {
    let temp_dir = TempDir::new().unwrap();
    let records = {
        let engine = start(&temp_dir);
        create_schema(&engine);
        let mut records = write_series(&engine, 0, 30);
        engine.force_flush("metrics", "cpu", 0).unwrap();
        records.extend(write_series(&engine, 30_000, 30));
        crash(engine);
        records
    };
    let engine = start(&temp_dir);
    assert_eq!(read(&engine, TimeRange::all()), records);

    engine.force_flush_all().unwrap();
    drop(engine);
    let engine = start(&temp_dir);
    assert_eq!(read(&engine, TimeRange::all()), records);
}

#[test]
fn test_rejected_write_is_not_replayed() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = start(&temp_dir);
        create_schema(&engine);
        write_series(&engine, 10_000, 1);
        assert!(matches!(
            engine.write("metrics", "cpu", 5_000, &[load(5_000, 1)]),
            Err(Error::InvalidRecordSet(_))
        ));
        crash(engine);
    }
    let engine = start(&temp_dir);
    assert_eq!(read(&engine, TimeRange::all()), vec![load(10_000, -50)]);
}

#[test]
fn test_flushed_segments_are_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let engine = start(&temp_dir);
    create_schema(&engine);
    write_series(&engine, 0, 1_000);
    assert!(engine.commit_log().closed_segments() > 0);

    engine.force_flush_all().unwrap();
    assert_eq!(engine.commit_log().closed_segments(), 0);
    assert!(engine.flush_manager().stats().completed() > 0);
}
