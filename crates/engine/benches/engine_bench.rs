//! Benchmarks for the HorizonDB storage engine.
//!
//! Run with: cargo bench --package horizondb-engine
//!
//! ## Benchmark Categories
//!
//! - **Delta encoding**: buffering records into a partition
//! - **B+Tree**: inserts and lookups over an on-disk tree
//! - **Commit log**: appends without sync
//! - **End-to-End**: engine writes and reads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use horizondb_engine::btree::{BTree, NodeManager, OnDiskNodeManager};
use horizondb_engine::commitlog::{ReplayPosition, WriteFuture};
use horizondb_engine::manager::DatabaseCodec;
use horizondb_engine::model::{
    Decimal, Field, FieldType, PartitionId, Record, RecordTypeDefinition, TimeRange,
};
use horizondb_engine::series::{NoopListener, TimeSeriesPartition};
use horizondb_engine::{
    CommitLog, CommitLogConfig, DatabaseDefinition, EngineConfig, StorageEngine, SyncMode,
    TimeSeriesDefinition,
};
use std::sync::Arc;
use tempfile::TempDir;

fn definition() -> TimeSeriesDefinition {
    TimeSeriesDefinition::new("bench", "quotes").with_record_type(
        RecordTypeDefinition::new("trade")
            .with_field("price", FieldType::Decimal)
            .with_field("volume", FieldType::Long),
    )
}

/// Generates slowly varying trades, one per millisecond.
fn generate_trades(count: usize) -> Vec<Record> {
    let mut price = 10_000i64;
    (0..count)
        .map(|i| {
            price += (i as i64 % 7) - 3;
            Record::new(
                0,
                vec![
                    Field::Timestamp(i as i64),
                    Field::Decimal(Decimal::new(price, -2)),
                    Field::Long(100 + (i as i64 % 13)),
                ],
            )
        })
        .collect()
}

fn bench_partition_write(c: &mut Criterion) {
    let trades = generate_trades(10_000);
    let mut group = c.benchmark_group("partition_write");
    group.throughput(Throughput::Elements(trades.len() as u64));

    for batch in [1usize, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let partition = TimeSeriesPartition::open(
                    PartitionId::new("bench", "quotes", TimeRange::new(0, 3_600_000)),
                    Arc::new(definition()),
                    temp_dir.path().join("0.ts"),
                    None,
                    usize::MAX,
                    512 * 1024,
                    Arc::new(NoopListener),
                )
                .unwrap();
                for chunk in trades.chunks(batch) {
                    partition
                        .write(black_box(chunk), || {
                            Ok(WriteFuture::completed(ReplayPosition::ZERO))
                        })
                        .unwrap();
                }
                partition
            })
        });
    }
    group.finish();
}

fn bench_btree(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let manager: Arc<dyn NodeManager<String, DatabaseDefinition>> = Arc::new(
        OnDiskNodeManager::open(temp_dir.path().join("databases.b3"), 4096, Arc::new(DatabaseCodec))
            .unwrap(),
    );
    let tree = BTree::new(manager, 64).unwrap();
    for i in 0..1_000 {
        let name = format!("db{i:05}");
        tree.insert(name.clone(), DatabaseDefinition::new(name)).unwrap();
    }

    c.bench_function("btree_get_1k", |b| {
        let key = "db00500".to_string();
        b.iter(|| tree.get(black_box(&key)).unwrap())
    });

    let mut next = 1_000;
    c.bench_function("btree_insert", |b| {
        b.iter(|| {
            let name = format!("db{next:05}");
            next += 1;
            tree.insert(name.clone(), DatabaseDefinition::new(name)).unwrap();
        })
    });
}

fn bench_commit_log(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let log = CommitLog::open(
        CommitLogConfig::new(temp_dir.path())
            .with_segment_size(4 * 1024 * 1024)
            .with_sync_mode(SyncMode::None),
    )
    .unwrap();
    let payload = vec![0xA5u8; 128];

    let mut group = c.benchmark_group("commit_log");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("write_128b", |b| {
        b.iter(|| log.write(black_box(&payload)).unwrap())
    });
    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::new(temp_dir.path());
    config.commit_log.sync_mode = SyncMode::None;
    let engine = StorageEngine::start(config).unwrap();
    engine
        .create_database(DatabaseDefinition::new("bench"), true)
        .unwrap();
    engine.create_time_series(definition(), true).unwrap();

    let trades = generate_trades(1_000);
    let mut offset = 0i64;
    c.bench_function("engine_write_batch_1k", |b| {
        b.iter(|| {
            let batch: Vec<Record> = trades
                .iter()
                .map(|record| {
                    let mut fields = record.fields().to_vec();
                    fields[0] = Field::Timestamp(offset + record.timestamp().unwrap());
                    Record::new(0, fields)
                })
                .collect();
            engine.write("bench", "quotes", offset, &batch).unwrap();
            offset += trades.len() as i64;
        })
    });

    c.bench_function("engine_read_all", |b| {
        b.iter(|| {
            engine
                .read("bench", "quotes", TimeRange::all())
                .unwrap()
                .count()
        })
    });
}

criterion_group!(
    benches,
    bench_partition_write,
    bench_btree,
    bench_commit_log,
    bench_engine
);
criterion_main!(benches);
