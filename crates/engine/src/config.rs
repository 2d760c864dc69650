//! Engine configuration.

use crate::btree::block_file::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::btree::{DEFAULT_BRANCHING_FACTOR, MIN_BRANCHING_FACTOR};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum size of a commit log segment (32 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024 * 1024;

/// Default number of drained segments kept for reuse.
pub const DEFAULT_MAX_RECYCLED_SEGMENTS: usize = 4;

/// Default sync interval for [`SyncMode::Periodic`].
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_millis(10);

/// Default size above which an in-memory partition buffer is full (1 MB).
pub const DEFAULT_MEM_SERIES_MAX_SIZE: usize = 1024 * 1024;

/// Default slab size of the in-memory buffers (512 KB).
pub const DEFAULT_SLAB_SIZE: usize = 512 * 1024;

/// Default bound on the memory held by buffered partitions (64 MB).
pub const DEFAULT_MAX_MEMORY_USAGE: usize = 64 * 1024 * 1024;

/// Default idle time after which a written partition is flushed and evicted.
pub const DEFAULT_WRITE_CACHE_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Default number of partitions kept open for reads.
pub const DEFAULT_READ_CACHE_MAX_ENTRIES: usize = 64;

/// Default time shutdown waits for pending flushes.
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Sync mode for commit log durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sync right after each group of writes (default, highest durability).
    #[default]
    Batch,
    /// Sync on a fixed interval; writers wait for the next sync.
    Periodic(Duration),
    /// Never sync explicitly (fastest, for testing only).
    None,
}

/// Configuration of the commit log.
#[derive(Debug, Clone)]
pub struct CommitLogConfig {
    /// Directory holding the segments.
    pub dir: PathBuf,
    /// Size of a pre-allocated segment.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
    /// Number of drained segments kept for reuse instead of being deleted.
    pub max_recycled_segments: usize,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("commitlog"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
            max_recycled_segments: DEFAULT_MAX_RECYCLED_SEGMENTS,
        }
    }
}

impl CommitLogConfig {
    /// Creates a configuration writing segments to `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the number of recycled segments kept around.
    pub fn with_max_recycled_segments(mut self, max: usize) -> Self {
        self.max_recycled_segments = max;
        self
    }

    /// Checks the configuration values.
    pub fn validate(&self) -> Result<()> {
        // An entry needs at least its overhead plus one payload byte.
        if self.segment_size < 64 {
            return Err(Error::InvalidConfig(format!(
                "commit log segment size {} is below 64 bytes",
                self.segment_size
            )));
        }
        if self.segment_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "commit log segment size {} does not fit in 32 bits",
                self.segment_size
            )));
        }
        if let SyncMode::Periodic(period) = self.sync_mode {
            if period.is_zero() {
                return Err(Error::InvalidConfig("sync period must not be zero".to_string()));
            }
        }
        Ok(())
    }
}

/// Configuration of a storage engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the metadata trees and partition files.
    pub data_dir: PathBuf,
    /// Block size of the B+Tree files.
    pub block_size: usize,
    /// Branching factor of the B+Trees.
    pub branching_factor: usize,
    /// Size above which an in-memory partition buffer reports itself full.
    pub mem_series_max_size: usize,
    /// Slab size used by the in-memory buffers.
    pub slab_size: usize,
    /// Bound on the memory held by buffered partitions.
    pub max_memory_usage: usize,
    /// Idle time after which a written partition is flushed and evicted.
    pub write_cache_expiry: Duration,
    /// Number of partitions kept open for reads.
    pub read_cache_max_entries: usize,
    /// Time shutdown waits for pending flushes.
    pub shutdown_wait: Duration,
    /// Commit log configuration.
    pub commit_log: CommitLogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            block_size: DEFAULT_BLOCK_SIZE,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
            mem_series_max_size: DEFAULT_MEM_SERIES_MAX_SIZE,
            slab_size: DEFAULT_SLAB_SIZE,
            max_memory_usage: DEFAULT_MAX_MEMORY_USAGE,
            write_cache_expiry: DEFAULT_WRITE_CACHE_EXPIRY,
            read_cache_max_entries: DEFAULT_READ_CACHE_MAX_ENTRIES,
            shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
            commit_log: CommitLogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `root`: data in `root/data`, commit
    /// log in `root/commitlog`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            commit_log: CommitLogConfig::new(root.join("commitlog")),
            ..Self::default()
        }
    }

    /// Sets the B+Tree block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the B+Tree branching factor.
    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    /// Sets the size above which a partition buffer is full.
    pub fn with_mem_series_max_size(mut self, size: usize) -> Self {
        self.mem_series_max_size = size;
        self
    }

    /// Sets the slab size.
    pub fn with_slab_size(mut self, size: usize) -> Self {
        self.slab_size = size;
        self
    }

    /// Sets the memory bound of buffered partitions.
    pub fn with_max_memory_usage(mut self, size: usize) -> Self {
        self.max_memory_usage = size;
        self
    }

    /// Sets the write cache expiry.
    pub fn with_write_cache_expiry(mut self, expiry: Duration) -> Self {
        self.write_cache_expiry = expiry;
        self
    }

    /// Sets the read cache capacity.
    pub fn with_read_cache_max_entries(mut self, entries: usize) -> Self {
        self.read_cache_max_entries = entries;
        self
    }

    /// Sets the shutdown wait.
    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    /// Sets the commit log configuration.
    pub fn with_commit_log(mut self, commit_log: CommitLogConfig) -> Self {
        self.commit_log = commit_log;
        self
    }

    /// Checks the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.branching_factor < MIN_BRANCHING_FACTOR {
            return Err(Error::InvalidConfig(format!(
                "branching factor {} is below {}",
                self.branching_factor, MIN_BRANCHING_FACTOR
            )));
        }
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block size {} is below {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        let sizes = [
            ("mem_series_max_size", self.mem_series_max_size),
            ("slab_size", self.slab_size),
            ("max_memory_usage", self.max_memory_usage),
            ("read_cache_max_entries", self.read_cache_max_entries),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{name} must not be zero")));
        }
        self.commit_log.validate()
    }
}
