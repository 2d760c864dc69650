//! Caching decorators of the partition manager.
//!
//! # Features
//!
//! - **Global cache**: weak references to every open partition, so the read
//!   and write paths never load the same partition twice
//! - **Read cache**: recently read partitions, bounded by entry count
//! - **Write cache**: recently written partitions, bounded by the memory held
//!   by their buffers and by idle time; an evicted partition is flushed

use super::PartitionManager;
use crate::error::Result;
use crate::model::{PartitionId, TimeRange, TimeSeriesDefinition};
use crate::series::{FlushTicket, TimeSeriesPartition};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Hit, miss and eviction counters of a cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: AtomicU64,
    /// Lookups that went to the inner layer.
    pub misses: AtomicU64,
    /// Entries removed to respect the cache bounds.
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the number of hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Gets the number of misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Gets the number of evictions.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Why an entry left the write cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Another instance was stored under the same key.
    Replaced,
    /// The entry was idle for longer than the expiry.
    Expired,
    /// The cache exceeded its memory bound.
    Size,
}

/// Keeps a weak reference to every partition handed out.
pub struct GlobalPartitionCache {
    inner: Arc<dyn PartitionManager>,
    partitions: Mutex<HashMap<PartitionId, Weak<TimeSeriesPartition>>>,
    stats: CacheStats,
}

impl GlobalPartitionCache {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn PartitionManager>) -> Self {
        Self {
            inner,
            partitions: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Partitions still referenced somewhere.
    pub fn live_partitions(&self) -> Vec<Arc<TimeSeriesPartition>> {
        self.partitions.lock().values().filter_map(Weak::upgrade).collect()
    }

    fn get_or_load<F>(&self, id: &PartitionId, load: F) -> Result<Option<Arc<TimeSeriesPartition>>>
    where
        F: FnOnce() -> Result<Option<Arc<TimeSeriesPartition>>>,
    {
        let mut partitions = self.partitions.lock();
        if let Some(partition) = partitions.get(id).and_then(Weak::upgrade) {
            self.stats.record_hit();
            return Ok(Some(partition));
        }
        self.stats.record_miss();
        partitions.retain(|_, partition| partition.strong_count() > 0);
        let loaded = load()?;
        if let Some(partition) = &loaded {
            partitions.insert(id.clone(), Arc::downgrade(partition));
        }
        Ok(loaded)
    }
}

impl PartitionManager for GlobalPartitionCache {
    fn get_partition_for_write(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        let loaded = self.get_or_load(id, || {
            self.inner.get_partition_for_write(id, definition).map(Some)
        })?;
        loaded.ok_or_else(|| crate::Error::Internal(format!("partition {id} was not created")))
    }

    fn get_partition_for_read(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Option<Arc<TimeSeriesPartition>>> {
        self.get_or_load(id, || self.inner.get_partition_for_read(id, definition))
    }

    fn partition_ranges(
        &self,
        database: &str,
        series: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeRange>> {
        self.inner.partition_ranges(database, series, range)
    }

    fn flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<()> {
        self.inner.flush(partition)
    }

    fn force_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket> {
        self.inner.force_flush(partition)
    }

    fn force_flush_all(&self) -> Result<()> {
        let tickets = self
            .live_partitions()
            .iter()
            .filter(|partition| partition.has_unflushed_data())
            .map(|partition| self.inner.force_flush(partition))
            .collect::<Result<Vec<_>>>()?;
        for ticket in tickets {
            ticket.wait()?;
        }
        self.inner.force_flush_all()
    }

    fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }
}

/// Keeps the most recently read partitions open.
pub struct ReadCachingPartitionManager {
    inner: Arc<dyn PartitionManager>,
    cache: Mutex<LruCache<PartitionId, Arc<TimeSeriesPartition>>>,
    stats: CacheStats,
}

impl ReadCachingPartitionManager {
    /// Wraps `inner` with a cache of `max_entries` partitions.
    pub fn new(inner: Arc<dyn PartitionManager>, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl PartitionManager for ReadCachingPartitionManager {
    fn get_partition_for_write(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        self.inner.get_partition_for_write(id, definition)
    }

    fn get_partition_for_read(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Option<Arc<TimeSeriesPartition>>> {
        if let Some(partition) = self.cache.lock().get(id) {
            self.stats.record_hit();
            return Ok(Some(Arc::clone(partition)));
        }
        self.stats.record_miss();
        let loaded = self.inner.get_partition_for_read(id, definition)?;
        if let Some(partition) = &loaded {
            let evicted = self.cache.lock().push(id.clone(), Arc::clone(partition));
            if evicted.is_some_and(|(key, _)| &key != id) {
                self.stats.record_eviction();
            }
        }
        Ok(loaded)
    }

    fn partition_ranges(
        &self,
        database: &str,
        series: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeRange>> {
        self.inner.partition_ranges(database, series, range)
    }

    fn flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<()> {
        self.inner.flush(partition)
    }

    fn force_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket> {
        self.inner.force_flush(partition)
    }

    fn force_flush_all(&self) -> Result<()> {
        self.inner.force_flush_all()
    }

    fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }
}

struct WriteEntry {
    partition: Arc<TimeSeriesPartition>,
    last_access: Instant,
}

/// Keeps recently written partitions open, bounded by buffered memory and
/// idle time.
///
/// Every partition leaving the cache is force flushed, unless it was
/// replaced by another instance of itself.
pub struct WriteCachingPartitionManager {
    inner: Arc<dyn PartitionManager>,
    entries: Mutex<LruCache<PartitionId, WriteEntry>>,
    max_memory_usage: usize,
    expiry: Duration,
    stats: CacheStats,
}

impl WriteCachingPartitionManager {
    /// Wraps `inner`. Partitions are evicted once the buffered memory exceeds
    /// `max_memory_usage` or after `expiry` without writes.
    pub fn new(inner: Arc<dyn PartitionManager>, max_memory_usage: usize, expiry: Duration) -> Self {
        Self {
            inner,
            entries: Mutex::new(LruCache::unbounded()),
            max_memory_usage,
            expiry,
            stats: CacheStats::default(),
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached partitions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no partition is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Evicts the expired partitions and, while the buffered memory is above
    /// the bound, the least recently written ones. The most recently written
    /// partition is never evicted for size.
    pub fn evict(&self) -> Result<()> {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut entries = self.entries.lock();
            while let Some((_, entry)) = entries.peek_lru() {
                if now.duration_since(entry.last_access) < self.expiry {
                    break;
                }
                if let Some((_, entry)) = entries.pop_lru() {
                    removed.push((entry.partition, RemovalCause::Expired));
                }
            }

            let mut usage = self.inner.memory_usage();
            for (partition, _) in &removed {
                usage = usage.saturating_sub(partition.memory_usage());
            }
            while usage > self.max_memory_usage && entries.len() > 1 {
                let Some((_, entry)) = entries.pop_lru() else {
                    break;
                };
                usage = usage.saturating_sub(entry.partition.memory_usage());
                removed.push((entry.partition, RemovalCause::Size));
            }
        }
        for (partition, cause) in removed {
            self.on_removal(&partition, cause)?;
        }
        Ok(())
    }

    fn on_removal(&self, partition: &Arc<TimeSeriesPartition>, cause: RemovalCause) -> Result<()> {
        self.stats.record_eviction();
        if cause == RemovalCause::Replaced {
            return Ok(());
        }
        debug!(
            "Partition {} left the write cache ({:?}), flushing",
            partition.id(),
            cause
        );
        self.inner.force_flush(partition).map(|_| ())
    }
}

impl PartitionManager for WriteCachingPartitionManager {
    fn get_partition_for_write(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        let now = Instant::now();
        let cached = self.entries.lock().get_mut(id).map(|entry| {
            entry.last_access = now;
            Arc::clone(&entry.partition)
        });
        let partition = match cached {
            Some(partition) => {
                self.stats.record_hit();
                partition
            }
            None => {
                self.stats.record_miss();
                let partition = self.inner.get_partition_for_write(id, definition)?;
                let previous = self.entries.lock().push(
                    id.clone(),
                    WriteEntry {
                        partition: Arc::clone(&partition),
                        last_access: now,
                    },
                );
                if let Some((key, entry)) = previous {
                    if &key == id && !Arc::ptr_eq(&entry.partition, &partition) {
                        self.on_removal(&entry.partition, RemovalCause::Replaced)?;
                    }
                }
                partition
            }
        };
        self.evict()?;
        Ok(partition)
    }

    fn get_partition_for_read(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Option<Arc<TimeSeriesPartition>>> {
        self.inner.get_partition_for_read(id, definition)
    }

    fn partition_ranges(
        &self,
        database: &str,
        series: &str,
        range: &TimeRange,
    ) -> Result<Vec<TimeRange>> {
        self.inner.partition_ranges(database, series, range)
    }

    fn flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<()> {
        self.inner.flush(partition)
    }

    fn force_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket> {
        self.inner.force_flush(partition)
    }

    fn force_flush_all(&self) -> Result<()> {
        let partitions: Vec<Arc<TimeSeriesPartition>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, entry)| Arc::clone(&entry.partition))
            .collect();
        let tickets = partitions
            .iter()
            .filter(|partition| partition.has_unflushed_data())
            .map(|partition| self.inner.force_flush(partition))
            .collect::<Result<Vec<_>>>()?;
        for ticket in tickets {
            ticket.wait()?;
        }
        self.inner.force_flush_all()
    }

    fn memory_usage(&self) -> usize {
        self.inner.memory_usage()
    }
}
