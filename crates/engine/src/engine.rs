//! Storage engine facade.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────┐
//! create / write ──────►│  CommitLog   │  entry appended first
//!                       └──────┬───────┘
//!                              ▼
//!         ┌────────────────────────────────────────┐
//!         │ DatabaseManager / TimeSeriesManager    │  B+Tree catalogs
//!         │ PartitionManager (caching decorators)  │  buffered partitions
//!         └──────────────────┬─────────────────────┘
//!                            ▼
//!                      FlushManager ──► <db>/<series>/<start>.ts
//! ```
//!
//! On start the commit log is replayed through the same managers. Partition
//! writes at or before the replay position saved with a partition are
//! skipped, so every mutation is applied once.

use crate::commitlog::{decode_records, CommitLog, LogEntry, ReplayPosition, WriteFuture};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::manager::{
    CachingDatabaseManager, CachingTimeSeriesManager, DatabaseManager, DefaultDatabaseManager,
    DefaultPartitionManager, DefaultTimeSeriesManager, GlobalPartitionCache, PartitionManager,
    ReadCachingPartitionManager, TimeSeriesManager, WriteCachingPartitionManager,
};
use crate::model::{
    DatabaseDefinition, PartitionId, Record, RecordIterator, TimeRange, TimeSeriesDefinition,
};
use crate::series::{FlushManager, PartitionLayout, DATABASES_FILE, TIME_SERIES_FILE};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Number of definitions kept by the catalog caches.
const CATALOG_CACHE_ENTRIES: usize = 256;

/// A running storage engine.
pub struct StorageEngine {
    config: EngineConfig,
    databases: Arc<dyn DatabaseManager>,
    series: Arc<dyn TimeSeriesManager>,
    partitions: Arc<dyn PartitionManager>,
    commit_log: Arc<CommitLog>,
    flusher: Arc<FlushManager>,
    /// Orders catalog log entries the same way as their application.
    catalog: Mutex<()>,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Opens the catalogs and the commit log, replays the log and returns the
    /// running engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration, or the
    /// first error raised while opening files or applying log entries.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        info!("Starting storage engine in {}", config.data_dir.display());

        let layout = PartitionLayout::new(&config.data_dir);
        let databases: Arc<dyn DatabaseManager> = Arc::new(DefaultDatabaseManager::open(
            layout.metadata_path(DATABASES_FILE),
            config.block_size,
            config.branching_factor,
        )?);
        let databases: Arc<dyn DatabaseManager> =
            Arc::new(CachingDatabaseManager::new(databases, CATALOG_CACHE_ENTRIES));
        let series: Arc<dyn TimeSeriesManager> = Arc::new(DefaultTimeSeriesManager::open(
            layout.metadata_path(TIME_SERIES_FILE),
            config.block_size,
            config.branching_factor,
            Arc::clone(&databases),
        )?);
        let series: Arc<dyn TimeSeriesManager> =
            Arc::new(CachingTimeSeriesManager::new(series, CATALOG_CACHE_ENTRIES));

        let commit_log = Arc::new(CommitLog::open(config.commit_log.clone())?);
        let flusher = Arc::new(FlushManager::start()?);
        let partitions: Arc<dyn PartitionManager> = Arc::new(DefaultPartitionManager::open(
            &config,
            Arc::clone(&commit_log),
            Arc::clone(&flusher),
        )?);
        let partitions: Arc<dyn PartitionManager> = Arc::new(GlobalPartitionCache::new(partitions));
        let partitions: Arc<dyn PartitionManager> = Arc::new(ReadCachingPartitionManager::new(
            partitions,
            config.read_cache_max_entries,
        ));
        let partitions: Arc<dyn PartitionManager> = Arc::new(WriteCachingPartitionManager::new(
            partitions,
            config.max_memory_usage,
            config.write_cache_expiry,
        ));

        let engine = Self {
            config,
            databases,
            series,
            partitions,
            commit_log,
            flusher,
            catalog: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        engine.replay()?;
        Ok(engine)
    }

    fn replay(&self) -> Result<()> {
        let stats = self
            .commit_log
            .replay(|position, payload| self.apply(position, payload))?;
        self.commit_log.discard_drained_segments()?;
        debug!(
            "Applied {} commit log entries, {} closed segments left",
            stats.entries,
            self.commit_log.closed_segments()
        );
        Ok(())
    }

    fn apply(&self, position: ReplayPosition, payload: Bytes) -> Result<()> {
        match LogEntry::decode(payload)? {
            LogEntry::CreateDatabase(definition) => {
                self.databases.create_database(definition, false)?;
            }
            LogEntry::CreateTimeSeries(definition) => {
                self.series.create_time_series(definition, false)?;
            }
            LogEntry::Write { partition, records } => {
                let definition = self
                    .series
                    .get_time_series(&partition.database, &partition.series)?;
                let target = self.partitions.get_partition_for_write(&partition, &definition)?;
                if position <= target.replay_position() {
                    return Ok(());
                }
                let records = decode_records(records, &definition)?;
                match target.write(&records, || Ok(WriteFuture::completed(position))) {
                    Ok(_) => self.partitions.flush(&target)?,
                    Err(Error::InvalidRecordSet(reason)) => {
                        warn!(
                            "Skipping commit log entry at {} for partition {}: {}",
                            position, partition, reason
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The commit log.
    pub fn commit_log(&self) -> &CommitLog {
        &self.commit_log
    }

    /// The flush executor.
    pub fn flush_manager(&self) -> &FlushManager {
        &self.flusher
    }

    /// Bytes held by the buffers of every open partition.
    pub fn memory_usage(&self) -> usize {
        self.partitions.memory_usage()
    }

    /// Creates a database. Returns `false` if it already existed and
    /// `throw_if_exists` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateDatabase`] if it exists and
    /// `throw_if_exists` is set, [`Error::InvalidSchema`] for an invalid name.
    pub fn create_database(&self, definition: DatabaseDefinition, throw_if_exists: bool) -> Result<bool> {
        self.ensure_running()?;
        definition.validate()?;
        let _catalog = self.catalog.lock();
        match self.databases.get_database(definition.name()) {
            Ok(_) if throw_if_exists => {
                return Err(Error::DuplicateDatabase(definition.name().to_string()))
            }
            Ok(_) => return Ok(false),
            Err(Error::UnknownDatabase(_)) => {}
            Err(e) => return Err(e),
        }
        let entry = LogEntry::CreateDatabase(definition.clone()).encode()?;
        self.commit_log.write(&entry)?.wait()?;
        self.databases.create_database(definition, throw_if_exists)
    }

    /// Returns the definition of database `name`.
    pub fn get_database(&self, name: &str) -> Result<Arc<DatabaseDefinition>> {
        self.databases.get_database(name)
    }

    /// Returns every database, sorted by name.
    pub fn list_databases(&self) -> Result<Vec<Arc<DatabaseDefinition>>> {
        self.databases.list_databases()
    }

    /// Creates a time series in an existing database. Returns `false` if it
    /// already existed and `throw_if_exists` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDatabase`], [`Error::DuplicateTimeSeries`] or
    /// [`Error::InvalidSchema`].
    pub fn create_time_series(
        &self,
        definition: TimeSeriesDefinition,
        throw_if_exists: bool,
    ) -> Result<bool> {
        self.ensure_running()?;
        definition.validate()?;
        let _catalog = self.catalog.lock();
        match self
            .series
            .get_time_series(definition.database(), definition.name())
        {
            Ok(_) if throw_if_exists => {
                return Err(Error::DuplicateTimeSeries {
                    database: definition.database().to_string(),
                    series: definition.name().to_string(),
                })
            }
            Ok(_) => return Ok(false),
            Err(Error::UnknownTimeSeries { .. }) => {}
            Err(e) => return Err(e),
        }
        let entry = LogEntry::CreateTimeSeries(definition.clone()).encode()?;
        self.commit_log.write(&entry)?.wait()?;
        self.series.create_time_series(definition, throw_if_exists)
    }

    /// Returns the definition of time series `name` of `database`.
    pub fn get_time_series(&self, database: &str, name: &str) -> Result<Arc<TimeSeriesDefinition>> {
        self.series.get_time_series(database, name)
    }

    /// Returns the time series of `database`, sorted by name.
    pub fn list_time_series(&self, database: &str) -> Result<Vec<Arc<TimeSeriesDefinition>>> {
        self.series.list_time_series(database)
    }

    fn partition_id(
        &self,
        database: &str,
        series: &str,
        partition_timestamp: i64,
    ) -> Result<(PartitionId, Arc<TimeSeriesDefinition>)> {
        let definition = self.series.get_time_series(database, series)?;
        let range = definition.partition_range(partition_timestamp);
        Ok((PartitionId::new(database, series, range), definition))
    }

    /// Writes `records` to the partition of `series` holding
    /// `partition_timestamp`.
    ///
    /// The records are logged, then buffered; the returned future completes
    /// once the log entry is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDatabase`] or [`Error::UnknownTimeSeries`],
    /// [`Error::InvalidRecordSet`] if the records cannot be applied, or
    /// [`Error::ShuttingDown`].
    pub fn write(
        &self,
        database: &str,
        series: &str,
        partition_timestamp: i64,
        records: &[Record],
    ) -> Result<WriteFuture> {
        self.ensure_running()?;
        let (id, definition) = self.partition_id(database, series, partition_timestamp)?;
        let partition = self.partitions.get_partition_for_write(&id, &definition)?;
        let future = partition.write(records, || {
            let entry = LogEntry::write(id.clone(), records)?.encode()?;
            self.commit_log.write(&entry)
        })?;
        self.partitions.flush(&partition)?;
        Ok(future)
    }

    /// Reads the records of `series` whose timestamp is within `range`, in
    /// time order.
    pub fn read(&self, database: &str, series: &str, range: TimeRange) -> Result<RecordIterator> {
        let definition = self.series.get_time_series(database, series)?;
        let mut iterators = Vec::new();
        for partition_range in self.partitions.partition_ranges(database, series, &range)? {
            let id = PartitionId::new(database, series, partition_range);
            if let Some(partition) = self.partitions.get_partition_for_read(&id, &definition)? {
                iterators.push(partition.read(range)?);
            }
        }
        Ok(Box::new(iterators.into_iter().flatten()))
    }

    /// Flushes the partition of `series` holding `partition_timestamp` and
    /// waits for the flush to complete.
    pub fn force_flush(&self, database: &str, series: &str, partition_timestamp: i64) -> Result<()> {
        let (id, definition) = self.partition_id(database, series, partition_timestamp)?;
        if let Some(partition) = self.partitions.get_partition_for_read(&id, &definition)? {
            self.partitions.force_flush(&partition)?.wait()?;
        }
        Ok(())
    }

    /// Flushes every partition with buffered data and waits for completion.
    pub fn force_flush_all(&self) -> Result<()> {
        self.partitions.force_flush_all()
    }

    /// Drains the flush executor, flushes every buffered partition and closes
    /// the commit log. Writes are refused from the first call on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the queued flushes did not complete
    /// within the configured shutdown wait.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down storage engine");
        let wait = self.config.shutdown_wait;
        self.flusher.drain(wait)?;
        self.partitions.force_flush_all()?;
        self.flusher.shutdown(wait)?;
        self.commit_log.discard_drained_segments()?;
        self.commit_log.close()?;
        info!("Storage engine stopped");
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Storage engine shutdown failed: {}", e);
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.config.data_dir)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::model::{Field, FieldType, RecordTypeDefinition};
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::new(temp_dir.path())
            .with_block_size(512)
            .with_branching_factor(4)
            .with_mem_series_max_size(128);
        config.commit_log.sync_mode = SyncMode::None;
        config.commit_log.segment_size = 64 * 1024;
        config
    }

    fn create_test_engine() -> (TempDir, StorageEngine) {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::start(config(&temp_dir)).unwrap();
        engine
            .create_database(DatabaseDefinition::new("db"), true)
            .unwrap();
        engine
            .create_time_series(
                TimeSeriesDefinition::new("db", "cpu").with_record_type(
                    RecordTypeDefinition::new("sample").with_field("value", FieldType::Long),
                ),
                true,
            )
            .unwrap();
        (temp_dir, engine)
    }

    fn sample(timestamp: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(timestamp), Field::Long(value)])
    }

    fn read_all(engine: &StorageEngine) -> Vec<Record> {
        engine
            .read("db", "cpu", TimeRange::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let (_temp_dir, engine) = create_test_engine();
        engine
            .write("db", "cpu", 1_000, &[sample(1_000, 1), sample(1_500, 3)])
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(read_all(&engine), vec![sample(1_000, 1), sample(1_500, 3)]);
    }

    #[test]
    fn test_catalog_errors() {
        let (_temp_dir, engine) = create_test_engine();
        assert!(matches!(
            engine.create_database(DatabaseDefinition::new("db"), true),
            Err(Error::DuplicateDatabase(_))
        ));
        assert!(!engine
            .create_database(DatabaseDefinition::new("db"), false)
            .unwrap());
        assert!(matches!(
            engine.write("db", "mem", 0, &[sample(0, 1)]),
            Err(Error::UnknownTimeSeries { .. })
        ));
        assert!(matches!(
            engine.read("nope", "cpu", TimeRange::all()),
            Err(Error::UnknownDatabase(_))
        ));
    }

    #[test]
    fn test_writes_refused_after_shutdown() {
        let (_temp_dir, engine) = create_test_engine();
        engine.shutdown().unwrap();
        assert!(matches!(
            engine.write("db", "cpu", 0, &[sample(0, 1)]),
            Err(Error::ShuttingDown)
        ));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir).with_branching_factor(1);
        assert!(matches!(
            StorageEngine::start(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
