//! Replay positions, segment ids and write futures.

use crate::error::{Error, Result};
use crate::io::{varint, ByteReader, ByteWriter};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Location in the commit log: a segment id and a byte offset within it.
///
/// Positions order by segment first, then offset. A position returned by a
/// write points just past the written entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ReplayPosition {
    /// Segment id.
    pub segment: u64,
    /// Byte offset within the segment.
    pub offset: u64,
}

impl ReplayPosition {
    /// Position before any entry of any segment.
    pub const ZERO: ReplayPosition = ReplayPosition { segment: 0, offset: 0 };

    /// Creates a position.
    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        varint::compute_u64_size(self.segment) + varint::compute_u64_size(self.offset)
    }

    /// Serializes the position.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_var_u64(self.segment)?;
        writer.write_var_u64(self.offset)
    }

    /// Deserializes a position.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let segment = reader.read_var_u64()?;
        let offset = reader.read_var_u64()?;
        Ok(Self::new(segment, offset))
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Time-based generator of strictly increasing segment ids.
///
/// An id is the current time in milliseconds, bumped past the last id handed
/// out or observed on disk so that ids keep increasing across restarts and
/// clock steps.
#[derive(Debug, Default)]
pub struct SegmentIdGenerator {
    last: AtomicU64,
}

impl SegmentIdGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id.
    pub fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Makes every future id greater than `id`.
    pub fn observe(&self, id: u64) {
        self.last.fetch_max(id, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct SyncState {
    synced: ReplayPosition,
    failure: Option<String>,
}

/// Durability watermark shared by the commit log and its write futures.
#[derive(Debug, Default)]
pub(crate) struct Durability {
    state: Mutex<SyncState>,
    changed: Condvar,
}

impl Durability {
    /// Records that every entry up to `position` is durable.
    pub(crate) fn advance(&self, position: ReplayPosition) {
        let mut state = self.state.lock();
        if position > state.synced {
            state.synced = position;
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Fails every write not yet durable.
    pub(crate) fn fail(&self, message: String) {
        self.state.lock().failure = Some(message);
        self.changed.notify_all();
    }

    fn is_synced(state: &SyncState, position: ReplayPosition) -> Result<bool> {
        if state.synced >= position {
            return Ok(true);
        }
        match &state.failure {
            Some(message) => Err(Error::CommitLogFailed(message.clone())),
            None => Ok(false),
        }
    }
}

/// Handle on a commit log write.
///
/// The position is known as soon as the entry is appended; [`wait`] blocks
/// until the entry has been synced to disk.
///
/// [`wait`]: WriteFuture::wait
#[derive(Debug, Clone)]
pub struct WriteFuture {
    position: ReplayPosition,
    durability: Arc<Durability>,
}

impl WriteFuture {
    pub(crate) fn new(position: ReplayPosition, durability: Arc<Durability>) -> Self {
        Self {
            position,
            durability,
        }
    }

    /// Returns a future that is already durable at `position`.
    pub fn completed(position: ReplayPosition) -> Self {
        let durability = Arc::new(Durability::default());
        durability.advance(position);
        Self::new(position, durability)
    }

    /// Position just past the written entry.
    pub fn position(&self) -> ReplayPosition {
        self.position
    }

    /// Returns `true` once the entry is durable.
    pub fn is_done(&self) -> bool {
        let state = self.durability.state.lock();
        matches!(Durability::is_synced(&state, self.position), Ok(true) | Err(_))
    }

    /// Blocks until the entry is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommitLogFailed`] if syncing the commit log failed.
    pub fn wait(&self) -> Result<ReplayPosition> {
        let mut state = self.durability.state.lock();
        while !Durability::is_synced(&state, self.position)? {
            self.durability.changed.wait(&mut state);
        }
        Ok(self.position)
    }

    /// Blocks until the entry is durable or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<ReplayPosition>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.durability.state.lock();
        while !Durability::is_synced(&state, self.position)? {
            if self.durability.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(Durability::is_synced(&state, self.position)?.then_some(self.position));
            }
        }
        Ok(Some(self.position))
    }
}
