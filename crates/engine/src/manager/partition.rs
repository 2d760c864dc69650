//! Partition manager backed by `partitions.b3` and the partition files.

use super::codec::PartitionCodec;
use super::PartitionManager;
use crate::btree::{BTree, OnDiskNodeManager};
use crate::commitlog::CommitLog;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{PartitionId, TimeRange, TimeSeriesDefinition};
use crate::series::{
    FlushManager, FlushTicket, PartitionLayout, PartitionListener, PartitionMetaData,
    TimeSeriesPartition, PARTITIONS_FILE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Bookkeeping shared by every partition opened by the manager.
struct PartitionHooks {
    metadata: BTree<PartitionId, PartitionMetaData>,
    commit_log: Arc<CommitLog>,
    memory: AtomicUsize,
}

impl PartitionListener for PartitionHooks {
    fn save_metadata(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()> {
        self.metadata.insert(id.clone(), *metadata)
    }

    fn first_dirty_segment_changed(&self, id: &PartitionId, segment: Option<u64>) {
        self.commit_log.tracker().set_first_dirty(id, segment);
    }

    fn memory_usage_changed(&self, _id: &PartitionId, previous: usize, current: usize) {
        if current >= previous {
            self.memory.fetch_add(current - previous, Ordering::Relaxed);
        } else {
            self.memory.fetch_sub(previous - current, Ordering::Relaxed);
        }
    }
}

/// Listener of one open partition.
///
/// While the partition has writes that are not in its file, the handle keeps
/// it alive, so dropping the last outside reference never discards them. The
/// reference is released by the flush that empties the buffers.
struct PartitionHandle {
    hooks: Arc<PartitionHooks>,
    partition: OnceLock<Weak<TimeSeriesPartition>>,
    pinned: Mutex<Option<Arc<TimeSeriesPartition>>>,
}

impl PartitionListener for PartitionHandle {
    fn save_metadata(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()> {
        self.hooks.save_metadata(id, metadata)
    }

    fn first_dirty_segment_changed(&self, id: &PartitionId, segment: Option<u64>) {
        self.hooks.first_dirty_segment_changed(id, segment);
        let pin = segment.and_then(|_| self.partition.get().and_then(Weak::upgrade));
        let released = std::mem::replace(&mut *self.pinned.lock(), pin);
        drop(released);
    }

    fn memory_usage_changed(&self, id: &PartitionId, previous: usize, current: usize) {
        self.hooks.memory_usage_changed(id, previous, current);
    }
}

/// Opens partitions from disk, without caching.
///
/// Every call to a `get_partition_*` method opens a new instance; the
/// caching decorators make sure only one instance per partition is alive.
pub struct DefaultPartitionManager {
    layout: PartitionLayout,
    mem_series_max_size: usize,
    slab_size: usize,
    hooks: Arc<PartitionHooks>,
    flusher: Arc<FlushManager>,
}

impl DefaultPartitionManager {
    /// Opens `partitions.b3` in the data directory of `config`.
    pub fn open(
        config: &EngineConfig,
        commit_log: Arc<CommitLog>,
        flusher: Arc<FlushManager>,
    ) -> Result<Self> {
        let layout = PartitionLayout::new(&config.data_dir);
        let manager = OnDiskNodeManager::open(
            layout.metadata_path(PARTITIONS_FILE),
            config.block_size,
            Arc::new(PartitionCodec),
        )?;
        let metadata = BTree::new(Arc::new(manager), config.branching_factor)?;
        Ok(Self {
            layout,
            mem_series_max_size: config.mem_series_max_size,
            slab_size: config.slab_size,
            hooks: Arc::new(PartitionHooks {
                metadata,
                commit_log,
                memory: AtomicUsize::new(0),
            }),
            flusher,
        })
    }

    fn open_partition(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
        metadata: PartitionMetaData,
    ) -> Result<Arc<TimeSeriesPartition>> {
        let handle = Arc::new(PartitionHandle {
            hooks: self.hooks.clone(),
            partition: OnceLock::new(),
            pinned: Mutex::new(None),
        });
        let partition = Arc::new(TimeSeriesPartition::open(
            id.clone(),
            Arc::clone(definition),
            self.layout.partition_path(id),
            Some(metadata),
            self.mem_series_max_size,
            self.slab_size,
            handle.clone(),
        )?);
        // The cell is fresh, setting it cannot fail.
        let _ = handle.partition.set(Arc::downgrade(&partition));
        Ok(partition)
    }

    fn submit_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket> {
        let partition = Arc::clone(partition);
        let commit_log = Arc::clone(&self.hooks.commit_log);
        self.flusher.submit(move || {
            partition.write_pending()?;
            commit_log.discard_drained_segments()
        })
    }
}

impl PartitionManager for DefaultPartitionManager {
    fn get_partition_for_write(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        let metadata = match self.hooks.metadata.get(id)? {
            Some(metadata) => metadata,
            None => {
                self.layout.ensure_partition_dir(id)?;
                let metadata = PartitionMetaData::new(id.range);
                if self.hooks.metadata.insert_if_absent(id.clone(), metadata)? {
                    debug!("Created partition {}", id);
                }
                metadata
            }
        };
        self.open_partition(id, definition, metadata)
    }

    fn get_partition_for_read(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Option<Arc<TimeSeriesPartition>>> {
        match self.hooks.metadata.get(id)? {
            Some(metadata) => self.open_partition(id, definition, metadata).map(Some),
            None => Ok(None),
        }
    }

    fn partition_ranges(
        &self,
        database: &str,
        series: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeRange>> {
        let start = PartitionId::new(database, series, TimeRange::new(i64::MIN, i64::MIN));
        let end = PartitionId::new(database, series, TimeRange::new(range.end, i64::MIN));
        Ok(self
            .hooks
            .metadata
            .range(Some(&start), Some(&end))?
            .into_iter()
            .map(|(id, _)| id.range)
            .filter(|partition| partition.overlaps(range))
            .collect())
    }

    fn flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<()> {
        if partition.swap_for_flush(false) {
            self.submit_flush(partition)?;
        }
        Ok(())
    }

    fn force_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket> {
        partition.swap_for_flush(true);
        self.submit_flush(partition)
    }

    fn force_flush_all(&self) -> Result<()> {
        // Open partitions are only known to the caches above.
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        self.hooks.memory.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commitlog::WriteFuture;
    use crate::config::SyncMode;
    use crate::model::{Field, FieldType, Record, RecordTypeDefinition};
    use tempfile::TempDir;

    pub(crate) fn definition() -> Arc<TimeSeriesDefinition> {
        Arc::new(
            TimeSeriesDefinition::new("db", "cpu").with_record_type(
                RecordTypeDefinition::new("sample").with_field("value", FieldType::Long),
            ),
        )
    }

    pub(crate) fn sample(timestamp: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(timestamp), Field::Long(value)])
    }

    pub(crate) fn partition_id(start: i64) -> PartitionId {
        PartitionId::new("db", "cpu", TimeRange::new(start, start + 1_000))
    }

    pub(crate) fn create_test_manager() -> (TempDir, Arc<CommitLog>, DefaultPartitionManager) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(temp_dir.path())
            .with_block_size(512)
            .with_branching_factor(4)
            .with_mem_series_max_size(64)
            .with_slab_size(1024);
        config.commit_log.sync_mode = SyncMode::None;
        config.commit_log.segment_size = 64 * 1024;
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let commit_log = Arc::new(CommitLog::open(config.commit_log.clone()).unwrap());
        let flusher = Arc::new(FlushManager::start().unwrap());
        let manager = DefaultPartitionManager::open(&config, commit_log.clone(), flusher).unwrap();
        (temp_dir, commit_log, manager)
    }

    pub(crate) fn write(
        commit_log: &CommitLog,
        partition: &TimeSeriesPartition,
        records: &[Record],
    ) -> WriteFuture {
        partition
            .write(records, || commit_log.write(b"entry"))
            .unwrap()
    }

    #[test]
    fn test_read_of_missing_partition() {
        let (_temp_dir, _log, manager) = create_test_manager();
        let found = manager
            .get_partition_for_read(&partition_id(0), &definition())
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_partition_ranges() {
        let (_temp_dir, _log, manager) = create_test_manager();
        for start in [3_000, 0, 1_000, 5_000] {
            manager
                .get_partition_for_write(&partition_id(start), &definition())
                .unwrap();
        }
        let ranges = manager
            .partition_ranges("db", "cpu", &TimeRange::new(500, 3_500))
            .unwrap();
        let starts: Vec<i64> = ranges.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, 1_000, 3_000]);
        assert!(manager
            .partition_ranges("db", "other", &TimeRange::all())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_force_flush_persists_and_releases_memory() {
        let (_temp_dir, commit_log, manager) = create_test_manager();
        let definition = definition();
        let partition = manager
            .get_partition_for_write(&partition_id(0), &definition)
            .unwrap();
        write(&commit_log, &partition, &[sample(10, 1), sample(20, 2)]);
        assert!(manager.memory_usage() > 0);
        assert!(commit_log.tracker().oldest_dirty_segment().is_some());

        manager.force_flush(&partition).unwrap().wait().unwrap();
        assert_eq!(manager.memory_usage(), 0);
        assert_eq!(commit_log.tracker().oldest_dirty_segment(), None);

        let reopened = manager
            .get_partition_for_read(&partition_id(0), &definition)
            .unwrap()
            .unwrap();
        let records: Vec<Record> = reopened
            .read(TimeRange::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, vec![sample(10, 1), sample(20, 2)]);
        assert_eq!(reopened.replay_position(), partition.replay_position());
    }

    #[test]
    fn test_unflushed_partition_outlives_its_handles() {
        let (_temp_dir, commit_log, manager) = create_test_manager();
        let partition = manager
            .get_partition_for_write(&partition_id(0), &definition())
            .unwrap();
        let weak = Arc::downgrade(&partition);
        drop(partition);
        assert!(weak.upgrade().is_none());

        let partition = manager
            .get_partition_for_write(&partition_id(0), &definition())
            .unwrap();
        write(&commit_log, &partition, &[sample(10, 1)]);
        let weak = Arc::downgrade(&partition);
        drop(partition);

        let partition = weak.upgrade().unwrap();
        manager.force_flush(&partition).unwrap().wait().unwrap();
        drop(partition);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_flush_only_when_full() {
        let (_temp_dir, commit_log, manager) = create_test_manager();
        let partition = manager
            .get_partition_for_write(&partition_id(0), &definition())
            .unwrap();
        write(&commit_log, &partition, &[sample(1, 1)]);
        manager.flush(&partition).unwrap();
        assert!(partition.has_unflushed_data());
        assert_eq!(partition.stats().flushes(), 0);
    }
}
