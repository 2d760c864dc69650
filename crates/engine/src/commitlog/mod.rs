//! Commit log for HorizonDB storage.
//!
//! Every mutation is appended to the commit log before it is applied, so a
//! crash can be recovered by replaying the log.
//!
//! # Architecture
//!
//! ```text
//! write → active segment (mmap) → syncer thread (msync) → WriteFuture done
//!                 │
//!                 └─ full → sync, close, take a recycled or fresh segment
//! ```
//!
//! # Features
//!
//! - **Pre-allocated segments**: fixed-size memory-mapped files named
//!   `CommitLog-<id>.log`
//! - **Dual checksums**: the length, seeded with the segment id, and the
//!   payload of every entry are protected by their own CRC
//! - **Group commit**: a syncer thread makes batches of writes durable
//! - **Recycling**: drained segments are renamed and reused
//! - **Tolerant replay**: a corrupt or partial tail ends replay of its segment

pub mod entry;
pub mod position;
pub mod segment;
pub mod tracker;

pub use entry::{decode_records, LogEntry};
pub use position::{ReplayPosition, SegmentIdGenerator, WriteFuture};
pub use segment::{
    CommitLogSegment, SegmentReplay, END_OF_SEGMENT_MARKER, LOG_OVERHEAD_SIZE, SEGMENT_EXTENSION,
    SEGMENT_PREFIX,
};
pub use tracker::DirtySegmentTracker;

use crate::config::{CommitLogConfig, SyncMode};
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use position::Durability;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Totals of a replay over all segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments read.
    pub segments: usize,
    /// Entries handed to the callback.
    pub entries: usize,
    /// Segments whose replay stopped on a corrupt or partial entry.
    pub truncated_segments: usize,
}

/// Counters exposed for monitoring.
#[derive(Debug, Default)]
pub struct CommitLogStats {
    /// Entries appended.
    pub entries_written: AtomicU64,
    /// Payload bytes appended.
    pub bytes_written: AtomicU64,
    /// Segments created from scratch.
    pub segments_created: AtomicU64,
    /// Segments reused after recycling.
    pub segments_recycled: AtomicU64,
    /// Segment files deleted.
    pub segments_deleted: AtomicU64,
    /// Syncs performed.
    pub syncs: AtomicU64,
}

struct LogState {
    active: CommitLogSegment,
    /// Closed segments that may still hold unflushed data, oldest first.
    closed: Vec<(u64, PathBuf)>,
    /// Drained segments ready for reuse.
    recycled: Vec<CommitLogSegment>,
    unsynced: bool,
    shutdown: bool,
}

struct Shared {
    config: CommitLogConfig,
    ids: SegmentIdGenerator,
    state: Mutex<LogState>,
    wake: Condvar,
    durability: Arc<Durability>,
    tracker: DirtySegmentTracker,
    stats: CommitLogStats,
}

/// The commit log.
pub struct CommitLog {
    shared: Arc<Shared>,
    syncer: Mutex<Option<JoinHandle<()>>>,
}

impl CommitLog {
    /// Opens the commit log in the configured directory.
    ///
    /// Segments found on disk are kept for [`replay`](Self::replay); new
    /// writes go to a fresh segment whose id is greater than all of them.
    pub fn open(config: CommitLogConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let ids = SegmentIdGenerator::new();
        let existing = Self::scan_existing_segments(&config.dir)?;
        if let Some((last, _)) = existing.last() {
            ids.observe(*last);
        }
        debug!(
            "Found {} commit log segments in {}",
            existing.len(),
            config.dir.display()
        );

        let stats = CommitLogStats::default();
        let active = CommitLogSegment::fresh(&config.dir, ids.next_id(), config.segment_size)?;
        stats.segments_created.fetch_add(1, Ordering::Relaxed);

        let durability = Arc::new(Durability::default());
        durability.advance(active.replay_position());

        let shared = Arc::new(Shared {
            state: Mutex::new(LogState {
                active,
                closed: existing,
                recycled: Vec::new(),
                unsynced: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            durability,
            tracker: DirtySegmentTracker::new(),
            stats,
            ids,
            config,
        });

        let syncer = match shared.config.sync_mode {
            SyncMode::None => None,
            _ => {
                let shared = shared.clone();
                Some(
                    thread::Builder::new()
                        .name("commitlog-sync".to_string())
                        .spawn(move || shared.run_syncer())?,
                )
            }
        };

        Ok(Self {
            shared,
            syncer: Mutex::new(syncer),
        })
    }

    /// Lists segment files in `dir`, sorted by id.
    fn scan_existing_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = CommitLogSegment::parse_id(&path) {
                segments.push((id, path));
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Replays every segment that existed when the log was opened, oldest
    /// first, handing each well-formed entry to `callback` with the position
    /// just past it.
    ///
    /// Corrupt or partial tails end the replay of their segment without
    /// failing; errors returned by `callback` abort the replay.
    pub fn replay<F>(&self, mut callback: F) -> Result<ReplayStats>
    where
        F: FnMut(ReplayPosition, Bytes) -> Result<()>,
    {
        let segments = self.shared.state.lock().closed.clone();
        let mut stats = ReplayStats::default();
        for (id, path) in segments {
            let mut segment = match CommitLogSegment::open(&path) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("Skipping commit log segment {}: {}", path.display(), e);
                    continue;
                }
            };
            let outcome = segment.replay(ReplayPosition::ZERO, &mut callback)?;
            stats.segments += 1;
            stats.entries += outcome.entries;
            if outcome.truncated {
                stats.truncated_segments += 1;
            }
            debug!("Replayed segment {} ({} entries)", id, outcome.entries);
        }
        info!(
            "Commit log replay complete: {} entries from {} segments ({} truncated)",
            stats.entries, stats.segments, stats.truncated_segments
        );
        Ok(stats)
    }

    /// Appends an entry.
    ///
    /// The returned future completes once the entry is durable according to
    /// the configured [`SyncMode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommitLogFailed`] if the entry can never fit in a
    /// segment, [`Error::ShuttingDown`] after [`close`](Self::close).
    pub fn write(&self, payload: &[u8]) -> Result<WriteFuture> {
        let shared = &self.shared;
        if payload.len() + LOG_OVERHEAD_SIZE > shared.config.segment_size {
            return Err(Error::CommitLogFailed(format!(
                "entry of {} bytes exceeds the segment size {}",
                payload.len(),
                shared.config.segment_size
            )));
        }

        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(Error::ShuttingDown);
        }
        if !state.active.has_capacity_for(payload.len()) {
            shared.roll_over(&mut state)?;
        }
        let position = state.active.write(payload)?;
        shared.stats.entries_written.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        match shared.config.sync_mode {
            SyncMode::None => shared.durability.advance(position),
            SyncMode::Batch => {
                state.unsynced = true;
                shared.wake.notify_one();
            }
            SyncMode::Periodic(_) => state.unsynced = true,
        }
        Ok(WriteFuture::new(position, shared.durability.clone()))
    }

    /// Syncs the active segment now and returns the durable position.
    pub fn sync(&self) -> Result<ReplayPosition> {
        let mut state = self.shared.state.lock();
        self.shared.sync_locked(&mut state)
    }

    /// Position of the next write.
    pub fn current_position(&self) -> ReplayPosition {
        self.shared.state.lock().active.replay_position()
    }

    /// Tracker of the segments holding unflushed partition data.
    pub fn tracker(&self) -> &DirtySegmentTracker {
        &self.shared.tracker
    }

    /// Monitoring counters.
    pub fn stats(&self) -> &CommitLogStats {
        &self.shared.stats
    }

    /// Number of closed segments still waiting for their data to be flushed.
    pub fn closed_segments(&self) -> usize {
        self.shared.state.lock().closed.len()
    }

    /// Recycles the closed segments that no partition needs anymore.
    ///
    /// A segment is drained once it is older than the oldest dirty segment of
    /// the tracker. Up to `max_recycled_segments` drained segments are kept
    /// for reuse; the others are deleted.
    pub fn discard_drained_segments(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let bound = shared
            .tracker
            .oldest_dirty_segment()
            .unwrap_or(state.active.id())
            .min(state.active.id());
        let drained: Vec<(u64, PathBuf)> = state
            .closed
            .iter()
            .filter(|(id, _)| *id < bound)
            .cloned()
            .collect();
        state.closed.retain(|(id, _)| *id >= bound);

        for (id, path) in drained {
            let reusable = state.recycled.len() < shared.config.max_recycled_segments;
            let segment = CommitLogSegment::open(&path)?;
            if reusable && segment.capacity() == shared.config.segment_size {
                let segment = segment.recycle(&shared.config.dir, shared.ids.next_id())?;
                state.recycled.push(segment);
            } else {
                segment.delete()?;
                shared.stats.segments_deleted.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Discarded drained commit log segment {}", id);
        }
        Ok(())
    }

    /// Stops the syncer, syncs the active segment and refuses further writes.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.syncer.lock().take() {
            if handle.join().is_err() {
                warn!("Commit log syncer thread panicked");
            }
        }
        let mut state = self.shared.state.lock();
        state.active.sync_all()?;
        let position = state.active.replay_position();
        self.shared.durability.advance(position);
        debug!("Closed commit log at {}", position);
        Ok(())
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.shared.config.dir
    }
}

impl Shared {
    fn sync_locked(&self, state: &mut LogState) -> Result<ReplayPosition> {
        let position = state.active.replay_position();
        if let Err(e) = state.active.sync() {
            self.durability.fail(e.to_string());
            return Err(e);
        }
        state.unsynced = false;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        self.durability.advance(position);
        Ok(position)
    }

    /// Closes the active segment and replaces it with a recycled or fresh one.
    fn roll_over(&self, state: &mut LogState) -> Result<()> {
        state.active.sync_all()?;
        self.durability.advance(state.active.replay_position());
        state.unsynced = false;

        let id = self.ids.next_id();
        let next = match state.recycled.pop() {
            Some(segment) => {
                self.stats.segments_recycled.fetch_add(1, Ordering::Relaxed);
                segment.recycle(&self.config.dir, id)?
            }
            None => {
                self.stats.segments_created.fetch_add(1, Ordering::Relaxed);
                CommitLogSegment::fresh(&self.config.dir, id, self.config.segment_size)?
            }
        };
        let previous = std::mem::replace(&mut state.active, next);
        debug!(
            "Rolled commit log over from segment {} to {}",
            previous.id(),
            id
        );
        state.closed.push((previous.id(), previous.path().to_path_buf()));
        Ok(())
    }

    fn run_syncer(&self) {
        let mut state = self.state.lock();
        loop {
            match self.config.sync_mode {
                SyncMode::Periodic(period) => {
                    if !state.shutdown {
                        self.wake.wait_for(&mut state, period);
                    }
                }
                _ => {
                    while !state.unsynced && !state.shutdown {
                        self.wake.wait(&mut state);
                    }
                }
            }
            if state.unsynced {
                if let Err(e) = self.sync_locked(&mut state) {
                    error!("Commit log sync failed: {}", e);
                }
            }
            if state.shutdown {
                break;
            }
        }
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close commit log on drop: {:?}", e);
        }
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("dir", &self.shared.config.dir)
            .field("position", &self.current_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_log(sync_mode: SyncMode) -> (TempDir, CommitLog) {
        let temp_dir = TempDir::new().unwrap();
        let config = CommitLogConfig::new(temp_dir.path())
            .with_segment_size(256)
            .with_sync_mode(sync_mode);
        let log = CommitLog::open(config).unwrap();
        (temp_dir, log)
    }

    fn reopen(temp_dir: &TempDir) -> CommitLog {
        let config = CommitLogConfig::new(temp_dir.path())
            .with_segment_size(256)
            .with_sync_mode(SyncMode::None);
        CommitLog::open(config).unwrap()
    }

    fn replay_payloads(log: &CommitLog) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        log.replay(|_, payload| {
            payloads.push(payload);
            Ok(())
        })
        .unwrap();
        payloads
    }

    #[test]
    fn test_batch_write_becomes_durable() {
        let (_temp_dir, log) = create_test_log(SyncMode::Batch);
        let future = log.write(b"entry").unwrap();
        let position = future.wait().unwrap();
        assert_eq!(position.offset, 5 + LOG_OVERHEAD_SIZE as u64);
        assert!(log.stats().syncs.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_periodic_write_becomes_durable() {
        let (_temp_dir, log) = create_test_log(SyncMode::Periodic(Duration::from_millis(5)));
        let future = log.write(b"entry").unwrap();
        assert!(future.wait_timeout(Duration::from_secs(5)).unwrap().is_some());
    }

    #[test]
    fn test_replay_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let log = reopen(&temp_dir);
            for i in 0..20u8 {
                log.write(&[i; 30]).unwrap();
            }
            log.close().unwrap();
        }
        let log = reopen(&temp_dir);
        let payloads = replay_payloads(&log);
        assert_eq!(payloads.len(), 20);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(payload.as_ref(), &[i as u8; 30]);
        }
        assert!(log.current_position().segment > 0);
    }

    #[test]
    fn test_rollover_orders_positions() {
        let (_temp_dir, log) = create_test_log(SyncMode::None);
        let mut last = ReplayPosition::ZERO;
        for _ in 0..20 {
            let position = log.write(&[0xAB; 50]).unwrap().position();
            assert!(position > last);
            last = position;
        }
        assert!(log.closed_segments() > 0);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let (_temp_dir, log) = create_test_log(SyncMode::None);
        let result = log.write(&[0u8; 300]);
        assert!(matches!(result, Err(Error::CommitLogFailed(_))));
    }

    #[test]
    fn test_drained_segments_recycled() {
        let (temp_dir, log) = create_test_log(SyncMode::None);
        for _ in 0..20 {
            log.write(&[1u8; 50]).unwrap();
        }
        let closed = log.closed_segments();
        assert!(closed >= 2);

        log.discard_drained_segments().unwrap();
        assert_eq!(log.closed_segments(), 0);
        let files = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(files, 1 + closed.min(4));

        // Recycled segments must not replay stale entries: only the two
        // entries of the last active segment come back.
        log.close().unwrap();
        drop(log);
        let log = reopen(&temp_dir);
        assert_eq!(replay_payloads(&log).len(), 20 - 3 * closed);
    }

    #[test]
    fn test_dirty_segments_not_recycled() {
        let (_temp_dir, log) = create_test_log(SyncMode::None);
        let first = log.write(&[1u8; 50]).unwrap().position();
        let partition = crate::model::PartitionId::new("db", "ts", crate::model::TimeRange::new(0, 1));
        log.tracker().mark_dirty(&partition, first.segment);
        for _ in 0..20 {
            log.write(&[1u8; 50]).unwrap();
        }
        let closed = log.closed_segments();
        log.discard_drained_segments().unwrap();
        assert_eq!(log.closed_segments(), closed);
    }

    #[test]
    fn test_write_after_close() {
        let (_temp_dir, log) = create_test_log(SyncMode::Batch);
        log.close().unwrap();
        assert!(matches!(log.write(b"late"), Err(Error::ShuttingDown)));
    }
}
