//! Slab allocator for buffered record bytes.
//!
//! Small per-write regions are carved out of large shared allocations.
//! Each region is an immutable [`Bytes`] view, so a slab is released once
//! every region cut from it has been dropped.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default slab size (512 KiB).
pub const DEFAULT_SLAB_SIZE: usize = 512 * 1024;

/// Allocation counters of a [`SlabAllocator`].
#[derive(Debug, Default)]
pub struct SlabStats {
    slabs_allocated: AtomicU64,
    bytes_allocated: AtomicU64,
    regions: AtomicU64,
}

impl SlabStats {
    /// Number of slabs allocated.
    pub fn slabs_allocated(&self) -> u64 {
        self.slabs_allocated.load(Ordering::Relaxed)
    }

    /// Total slab capacity allocated in bytes.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Number of regions handed out.
    pub fn regions(&self) -> u64 {
        self.regions.load(Ordering::Relaxed)
    }
}

/// Pool allocator handing out regions of fixed-size slabs.
#[derive(Debug)]
pub struct SlabAllocator {
    slab_size: usize,
    current: Mutex<BytesMut>,
    stats: SlabStats,
}

impl SlabAllocator {
    /// Creates an allocator carving regions out of `slab_size` byte slabs.
    pub fn new(slab_size: usize) -> Self {
        Self {
            slab_size: slab_size.max(1),
            current: Mutex::new(BytesMut::new()),
            stats: SlabStats::default(),
        }
    }

    /// Copies `data` into the current slab and returns the region holding it.
    ///
    /// A region larger than the slab size gets a dedicated allocation.
    pub fn copy(&self, data: &[u8]) -> Bytes {
        let mut current = self.current.lock();
        if current.capacity() - current.len() < data.len() {
            let size = self.slab_size.max(data.len());
            *current = BytesMut::with_capacity(size);
            self.stats.slabs_allocated.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_allocated
                .fetch_add(size as u64, Ordering::Relaxed);
        }
        current.extend_from_slice(data);
        self.stats.regions.fetch_add(1, Ordering::Relaxed);
        current.split().freeze()
    }

    /// Size of a regular slab.
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Allocation counters.
    pub fn stats(&self) -> &SlabStats {
        &self.stats
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SLAB_SIZE)
    }
}
