//! A time series partition: the data file plus the buffered tail.
//!
//! # Architecture
//!
//! ```text
//!                 write                      flush (flush thread)
//!                   |                              |
//!                   v                              v
//! +-----------------------------+   swap   +-----------------+   append   +------+
//! | active MemTimeSeries        | -------> | pending buffers | ---------> | .ts  |
//! +-----------------------------+          +-----------------+            +------+
//!                   ^                              ^                         ^
//!                   +------------ read: file bytes, pending, active ---------+
//! ```
//!
//! Writes and buffer swaps happen under the partition state lock; appends to
//! the file happen outside of it so that writers are never blocked by disk
//! I/O. Readers snapshot the committed file size and the buffers under the
//! lock and decode them as one stream.

use super::file::{self, TimeSeriesFile};
use super::mem::MemTimeSeries;
use crate::commitlog::{ReplayPosition, WriteFuture};
use crate::error::{Error, Result};
use crate::io::{varint, ByteReader, ByteWriter, ChunkedReader, SlabAllocator};
use crate::model::{PartitionId, Record, RecordDecoder, RecordIterator, TimeRange, TimeSeriesDefinition};
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Persistent state of a partition, stored in the partition metadata tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetaData {
    /// Partition range.
    pub range: TimeRange,
    /// Size of the data file after the last complete flush.
    pub file_size: u64,
    /// Commit log position of the last write contained in the data file.
    pub replay_position: ReplayPosition,
}

impl PartitionMetaData {
    /// Metadata of a partition that has never been flushed.
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            file_size: 0,
            replay_position: ReplayPosition::ZERO,
        }
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        varint::compute_i64_size(self.range.start)
            + varint::compute_i64_size(self.range.end)
            + varint::compute_u64_size(self.file_size)
            + self.replay_position.compute_size()
    }

    /// Serializes the metadata.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_var_i64(self.range.start)?;
        writer.write_var_i64(self.range.end)?;
        writer.write_var_u64(self.file_size)?;
        self.replay_position.write_to(writer)
    }

    /// Deserializes the metadata.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let start = reader.read_var_i64()?;
        let end = reader.read_var_i64()?;
        let file_size = reader.read_var_u64()?;
        let replay_position = ReplayPosition::read_from(reader)?;
        Ok(Self {
            range: TimeRange::new(start, end),
            file_size,
            replay_position,
        })
    }
}

/// Receives the state changes of a partition that its owner must track.
pub trait PartitionListener: Send + Sync {
    /// Persists the metadata of a completed flush. Called before the flushed
    /// buffers are released; an error leaves them pending.
    fn save_metadata(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()>;

    /// The first commit log segment holding unflushed writes of the
    /// partition changed. Called under the partition state lock.
    fn first_dirty_segment_changed(&self, id: &PartitionId, segment: Option<u64>);

    /// The memory held by the buffers of the partition changed.
    fn memory_usage_changed(&self, id: &PartitionId, previous: usize, current: usize);
}

/// Listener ignoring every event, for standalone partitions.
#[derive(Debug, Default)]
pub struct NoopListener;

impl PartitionListener for NoopListener {
    fn save_metadata(&self, _id: &PartitionId, _metadata: &PartitionMetaData) -> Result<()> {
        Ok(())
    }

    fn first_dirty_segment_changed(&self, _id: &PartitionId, _segment: Option<u64>) {}

    fn memory_usage_changed(&self, _id: &PartitionId, _previous: usize, _current: usize) {}
}

/// Counters of a partition.
#[derive(Debug, Default)]
pub struct PartitionStats {
    /// Records accepted by writes.
    pub records_written: AtomicU64,
    /// Record sets rejected by writes.
    pub writes_rejected: AtomicU64,
    /// Completed flushes.
    pub flushes: AtomicU64,
    /// Bytes appended to the data file.
    pub bytes_flushed: AtomicU64,
    /// Bytes held by the in-memory buffers.
    pub memory_bytes: AtomicUsize,
}

impl PartitionStats {
    /// Gets the number of records written.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Gets the number of completed flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Gets the number of bytes flushed.
    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed.load(Ordering::Relaxed)
    }

    /// Gets the buffered memory.
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes.load(Ordering::Relaxed)
    }
}

struct PartitionState {
    active: MemTimeSeries,
    /// Buffers swapped out and waiting to be appended, oldest first.
    pending: Vec<MemTimeSeries>,
    /// File size visible to readers.
    file_size: u64,
    replay_position: ReplayPosition,
}

impl PartitionState {
    fn memory_usage(&self) -> usize {
        self.active.size() + self.pending.iter().map(MemTimeSeries::size).sum::<usize>()
    }

    fn first_dirty_segment(&self) -> Option<u64> {
        self.pending
            .iter()
            .chain(std::iter::once(&self.active))
            .find_map(|mem| mem.first_write())
            .map(|future| future.position().segment)
    }
}

/// One time series restricted to one time range.
pub struct TimeSeriesPartition {
    id: PartitionId,
    definition: Arc<TimeSeriesDefinition>,
    path: PathBuf,
    header_size: u64,
    max_mem_size: usize,
    allocator: SlabAllocator,
    state: Mutex<PartitionState>,
    file: Mutex<TimeSeriesFile>,
    listener: Arc<dyn PartitionListener>,
    stats: PartitionStats,
}

impl TimeSeriesPartition {
    /// Opens the partition `id` whose file is at `path`.
    ///
    /// `metadata` is the state saved by the last flush, `None` for a new
    /// partition. The file is cut back to the saved size and decoded to
    /// restore the last record of every type, so that new writes continue the
    /// delta chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the file does not match the partition
    /// or its records cannot be decoded.
    pub fn open(
        id: PartitionId,
        definition: Arc<TimeSeriesDefinition>,
        path: impl AsRef<Path>,
        metadata: Option<PartitionMetaData>,
        max_mem_size: usize,
        slab_size: usize,
        listener: Arc<dyn PartitionListener>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = TimeSeriesFile::open(&path, &id, metadata.map(|m| m.file_size))?;
        let data = file.read_data(file.size())?;

        let mut decoder = RecordDecoder::new(ChunkedReader::new([data]), definition.clone());
        for record in decoder.by_ref() {
            record?;
        }
        let last = decoder.into_last_records();

        debug!(
            "Opened partition {} ({} data bytes)",
            id,
            file.data_size()
        );

        let active = MemTimeSeries::with_last_records(definition.clone(), id.range, last);
        Ok(Self {
            header_size: file.header_size(),
            state: Mutex::new(PartitionState {
                active,
                pending: Vec::new(),
                file_size: file.size(),
                replay_position: metadata.map(|m| m.replay_position).unwrap_or_default(),
            }),
            file: Mutex::new(file),
            id,
            definition,
            path,
            max_mem_size,
            allocator: SlabAllocator::new(slab_size),
            listener,
            stats: PartitionStats::default(),
        })
    }

    /// Partition id.
    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Definition of the time series.
    pub fn definition(&self) -> &Arc<TimeSeriesDefinition> {
        &self.definition
    }

    /// Commit log position up to which the writes of this partition are in
    /// its file. Replayed entries at or before it must be skipped.
    pub fn replay_position(&self) -> ReplayPosition {
        self.state.lock().replay_position
    }

    /// Bytes held by the in-memory buffers.
    pub fn memory_usage(&self) -> usize {
        self.state.lock().memory_usage()
    }

    /// Returns `true` when the active buffer reached its maximum size.
    pub fn is_full(&self) -> bool {
        self.state.lock().active.is_full(self.max_mem_size)
    }

    /// Returns `true` if some writes are not yet in the data file.
    pub fn has_unflushed_data(&self) -> bool {
        let state = self.state.lock();
        !state.active.is_empty() || !state.pending.is_empty()
    }

    /// Statistics.
    pub fn stats(&self) -> &PartitionStats {
        &self.stats
    }

    /// Writes `records`, obtaining the durability future from `log` once they
    /// are validated.
    ///
    /// `log` runs under the partition lock, so commit log entries are ordered
    /// the same way as the buffered records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordSet`] if the records cannot be applied,
    /// in which case `log` is not called.
    pub fn write<F>(&self, records: &[Record], log: F) -> Result<WriteFuture>
    where
        F: FnOnce() -> Result<WriteFuture>,
    {
        let mut state = self.state.lock();
        let previous = state.memory_usage();
        let updated = match state.active.write_with(&self.allocator, records, log) {
            Ok(updated) => updated,
            Err(e) => {
                if matches!(e, Error::InvalidRecordSet(_)) {
                    self.stats.writes_rejected.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };
        let future = updated
            .last_write()
            .cloned()
            .ok_or_else(|| Error::Internal("write produced no future".into()))?;
        let first_dirty = state.first_dirty_segment();
        state.active = updated;
        if first_dirty.is_none() {
            self.listener
                .first_dirty_segment_changed(&self.id, state.first_dirty_segment());
        }
        let current = state.memory_usage();
        drop(state);

        self.stats
            .records_written
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.stats.memory_bytes.store(current, Ordering::Relaxed);
        self.listener.memory_usage_changed(&self.id, previous, current);
        Ok(future)
    }

    /// Returns the absolute records with a timestamp within `range`, file
    /// content first, then the buffered writes.
    pub fn read(&self, range: TimeRange) -> Result<RecordIterator> {
        let (file_size, chunks) = {
            let state = self.state.lock();
            let chunks: Vec<Bytes> = state
                .pending
                .iter()
                .chain(std::iter::once(&state.active))
                .flat_map(|mem| mem.buffer().chunks())
                .collect();
            (state.file_size, chunks)
        };
        let data = file::read_data(&self.path, self.header_size, file_size)?;
        let mut reader = ChunkedReader::new([data]);
        reader.extend(chunks);
        Ok(Box::new(RecordDecoder::with_range(
            reader,
            self.definition.clone(),
            range,
        )))
    }

    /// Swaps the active buffer out for flushing.
    ///
    /// Without `force`, only a full buffer is swapped. Returns `true` if a
    /// buffer is now waiting for [`write_pending`](Self::write_pending).
    pub fn swap_for_flush(&self, force: bool) -> bool {
        let mut state = self.state.lock();
        let swap = !state.active.is_empty() && (force || state.active.is_full(self.max_mem_size));
        if swap {
            let next = state.active.continuation();
            let full = std::mem::replace(&mut state.active, next);
            state.pending.push(full);
        }
        !state.pending.is_empty()
    }

    /// Appends every pending buffer to the data file in one batch, saves the
    /// new metadata and releases the buffers.
    ///
    /// Returns the number of bytes appended.
    pub fn write_pending(&self) -> Result<u64> {
        let mut file = self.file.lock();
        let pending: Vec<MemTimeSeries> = self.state.lock().pending.clone();
        let Some(last) = pending.last() else {
            return Ok(0);
        };
        let replay_position = last
            .last_write()
            .map(WriteFuture::position)
            .unwrap_or_default();

        debug!(
            "Flushing {} buffer(s) of partition {} up to {}",
            pending.len(),
            self.id,
            replay_position
        );
        let chunks: Vec<Bytes> = pending.iter().flat_map(|mem| mem.buffer().chunks()).collect();
        let before = file.size();
        let file_size = file.append(&chunks)?;
        let metadata = PartitionMetaData {
            range: self.id.range,
            file_size,
            replay_position,
        };
        if let Err(e) = self.listener.save_metadata(&self.id, &metadata) {
            // The buffers stay pending and are appended again by the next flush.
            file.truncate(before)?;
            return Err(e);
        }

        let mut state = self.state.lock();
        let previous = state.memory_usage();
        state.pending.drain(..pending.len());
        state.file_size = file_size;
        state.replay_position = state.replay_position.max(replay_position);
        self.listener
            .first_dirty_segment_changed(&self.id, state.first_dirty_segment());
        let current = state.memory_usage();
        drop(state);

        let appended = file_size - before;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_flushed.fetch_add(appended, Ordering::Relaxed);
        self.stats.memory_bytes.store(current, Ordering::Relaxed);
        self.listener.memory_usage_changed(&self.id, previous, current);
        debug!("Flushed {} bytes of partition {}", appended, self.id);
        Ok(appended)
    }

    /// Swaps the active buffer out and writes every pending buffer.
    pub fn force_flush(&self) -> Result<u64> {
        if self.swap_for_flush(true) {
            self.write_pending()
        } else {
            Ok(0)
        }
    }
}

impl std::fmt::Debug for TimeSeriesPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesPartition")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldType, RecordTypeDefinition};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingListener {
        saved: PlMutex<Vec<PartitionMetaData>>,
        dirty: PlMutex<Vec<Option<u64>>>,
        usage: AtomicUsize,
        fail_next_save: AtomicBool,
    }

    impl PartitionListener for RecordingListener {
        fn save_metadata(&self, _id: &PartitionId, metadata: &PartitionMetaData) -> Result<()> {
            if self.fail_next_save.swap(false, Ordering::Relaxed) {
                return Err(Error::Internal("metadata tree unavailable".into()));
            }
            self.saved.lock().push(*metadata);
            Ok(())
        }

        fn first_dirty_segment_changed(&self, _id: &PartitionId, segment: Option<u64>) {
            self.dirty.lock().push(segment);
        }

        fn memory_usage_changed(&self, _id: &PartitionId, _previous: usize, current: usize) {
            self.usage.store(current, Ordering::Relaxed);
        }
    }

    fn definition() -> Arc<TimeSeriesDefinition> {
        Arc::new(
            TimeSeriesDefinition::new("db", "cpu").with_record_type(
                RecordTypeDefinition::new("sample").with_field("value", FieldType::Long),
            ),
        )
    }

    fn sample(timestamp: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(timestamp), Field::Long(value)])
    }

    fn id() -> PartitionId {
        PartitionId::new("db", "cpu", TimeRange::new(0, 3_600_000))
    }

    fn open(
        temp_dir: &TempDir,
        metadata: Option<PartitionMetaData>,
        listener: Arc<RecordingListener>,
    ) -> TimeSeriesPartition {
        TimeSeriesPartition::open(
            id(),
            definition(),
            temp_dir.path().join("0.ts"),
            metadata,
            64,
            1024,
            listener,
        )
        .unwrap()
    }

    fn create_test_partition() -> (TempDir, Arc<RecordingListener>, TimeSeriesPartition) {
        let temp_dir = TempDir::new().unwrap();
        let listener = Arc::new(RecordingListener::default());
        let partition = open(&temp_dir, None, listener.clone());
        (temp_dir, listener, partition)
    }

    fn write(partition: &TimeSeriesPartition, segment: u64, offset: u64, records: &[Record]) {
        partition
            .write(records, || {
                Ok(WriteFuture::completed(ReplayPosition::new(segment, offset)))
            })
            .unwrap();
    }

    fn read_all(partition: &TimeSeriesPartition) -> Vec<Record> {
        partition
            .read(TimeRange::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_metadata_round_trip() {
        let metadata = PartitionMetaData {
            range: TimeRange::new(-10, 10),
            file_size: 1_234,
            replay_position: ReplayPosition::new(7, 99),
        };
        let mut buffer = crate::io::WriteBuffer::new();
        metadata.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len(), metadata.compute_size());
        let mut reader = crate::io::ReadBuffer::new(buffer.freeze());
        assert_eq!(PartitionMetaData::read_from(&mut reader).unwrap(), metadata);
    }

    #[test]
    fn test_read_merges_file_and_buffers() {
        let (_temp_dir, _listener, partition) = create_test_partition();
        write(&partition, 1, 10, &[sample(1_000, 5), sample(2_000, 7)]);
        partition.force_flush().unwrap();
        write(&partition, 1, 20, &[sample(3_000, 6)]);

        assert_eq!(
            read_all(&partition),
            vec![sample(1_000, 5), sample(2_000, 7), sample(3_000, 6)]
        );
        let window: Vec<Record> = partition
            .read(TimeRange::new(2_000, 3_000))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(window, vec![sample(2_000, 7)]);
    }

    #[test]
    fn test_flush_saves_metadata_and_releases_segments() {
        let (_temp_dir, listener, partition) = create_test_partition();
        write(&partition, 4, 10, &[sample(1_000, 1)]);
        assert_eq!(listener.dirty.lock().as_slice(), &[Some(4)]);
        assert!(partition.memory_usage() > 0);

        let appended = partition.force_flush().unwrap();
        assert!(appended > 0);
        assert_eq!(partition.memory_usage(), 0);
        assert_eq!(listener.usage.load(Ordering::Relaxed), 0);
        assert_eq!(listener.dirty.lock().last(), Some(&None));
        assert_eq!(partition.replay_position(), ReplayPosition::new(4, 10));

        let saved = listener.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].replay_position, ReplayPosition::new(4, 10));
        assert_eq!(partition.stats().flushes(), 1);
    }

    #[test]
    fn test_swap_only_when_full() {
        let (_temp_dir, _listener, partition) = create_test_partition();
        write(&partition, 1, 1, &[sample(1, 1)]);
        assert!(!partition.swap_for_flush(false));

        let records: Vec<Record> = (2..40).map(|t| sample(t, t * 1_000)).collect();
        write(&partition, 1, 2, &records);
        assert!(partition.is_full());
        assert!(partition.swap_for_flush(false));
        assert!(!partition.is_full());
        assert!(partition.has_unflushed_data());
        partition.write_pending().unwrap();
        assert!(!partition.has_unflushed_data());
    }

    #[test]
    fn test_reopen_continues_delta_chain() {
        let (temp_dir, listener, partition) = create_test_partition();
        write(&partition, 1, 10, &[sample(1_000, 5)]);
        partition.force_flush().unwrap();
        let metadata = listener.saved.lock()[0];
        drop(partition);

        let partition = open(&temp_dir, Some(metadata), listener);
        assert_eq!(partition.replay_position(), ReplayPosition::new(1, 10));
        let delta = sample(2_000, 8).subtract(&sample(1_000, 5)).unwrap();
        write(&partition, 2, 10, &[delta]);
        assert_eq!(read_all(&partition), vec![sample(1_000, 5), sample(2_000, 8)]);
    }

    #[test]
    fn test_reopen_drops_unsaved_flush() {
        let (temp_dir, listener, partition) = create_test_partition();
        write(&partition, 1, 10, &[sample(1_000, 5)]);
        partition.force_flush().unwrap();
        let metadata = listener.saved.lock()[0];
        write(&partition, 1, 20, &[sample(2_000, 6)]);
        partition.force_flush().unwrap();
        drop(partition);

        let partition = open(&temp_dir, Some(metadata), listener);
        assert_eq!(read_all(&partition), vec![sample(1_000, 5)]);
    }

    #[test]
    fn test_failed_metadata_save_does_not_duplicate_flush() {
        let (temp_dir, listener, partition) = create_test_partition();
        write(&partition, 1, 10, &[sample(1_000, 5)]);
        partition.force_flush().unwrap();
        let flushed_size = listener.saved.lock()[0].file_size;

        write(&partition, 1, 20, &[sample(2_000, 7)]);
        listener.fail_next_save.store(true, Ordering::Relaxed);
        assert!(matches!(partition.force_flush(), Err(Error::Internal(_))));
        assert_eq!(
            std::fs::metadata(temp_dir.path().join("0.ts")).unwrap().len(),
            flushed_size
        );
        assert!(partition.has_unflushed_data());

        partition.force_flush().unwrap();
        assert_eq!(read_all(&partition), vec![sample(1_000, 5), sample(2_000, 7)]);

        let metadata = *listener.saved.lock().last().unwrap();
        drop(partition);
        let partition = open(&temp_dir, Some(metadata), listener);
        assert_eq!(read_all(&partition), vec![sample(1_000, 5), sample(2_000, 7)]);
    }

    #[test]
    fn test_rejected_write_counted() {
        let (_temp_dir, listener, partition) = create_test_partition();
        let result = partition.write(&[sample(4_000_000, 1)], || {
            Ok(WriteFuture::completed(ReplayPosition::new(1, 1)))
        });
        assert!(matches!(result, Err(Error::InvalidRecordSet(_))));
        assert!(listener.dirty.lock().is_empty());
        assert_eq!(partition.stats().records_written(), 0);
    }
}
