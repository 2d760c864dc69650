//! Tracking of the commit log segments still holding unflushed data.

use crate::model::PartitionId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Remembers, for every partition with buffered data, the first commit log
/// segment holding one of its unflushed writes.
///
/// Segments older than [`oldest_dirty_segment`] only hold data already
/// written to partition files and can be recycled.
///
/// [`oldest_dirty_segment`]: DirtySegmentTracker::oldest_dirty_segment
#[derive(Debug, Default)]
pub struct DirtySegmentTracker {
    dirty: RwLock<HashMap<PartitionId, u64>>,
}

impl DirtySegmentTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write of `partition` into `segment`. A partition already
    /// dirty keeps its older segment.
    pub fn mark_dirty(&self, partition: &PartitionId, segment: u64) {
        let mut dirty = self.dirty.write();
        dirty
            .entry(partition.clone())
            .and_modify(|first| *first = (*first).min(segment))
            .or_insert(segment);
    }

    /// Replaces the first dirty segment of `partition`, typically after a
    /// flush: `first` is the segment of the oldest write still buffered, or
    /// `None` once everything reached the partition file.
    pub fn set_first_dirty(&self, partition: &PartitionId, first: Option<u64>) {
        let mut dirty = self.dirty.write();
        match first {
            Some(segment) => {
                dirty.insert(partition.clone(), segment);
            }
            None => {
                dirty.remove(partition);
            }
        }
    }

    /// Oldest segment still needed for replay, or `None` if every write has
    /// been flushed.
    pub fn oldest_dirty_segment(&self) -> Option<u64> {
        self.dirty.read().values().copied().min()
    }

    /// Number of partitions with unflushed data.
    pub fn dirty_partitions(&self) -> usize {
        self.dirty.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeRange;

    fn partition(start: i64) -> PartitionId {
        PartitionId::new("db", "ts", TimeRange::new(start, start + 10))
    }

    #[test]
    fn test_oldest_dirty_segment() {
        let tracker = DirtySegmentTracker::new();
        assert_eq!(tracker.oldest_dirty_segment(), None);

        tracker.mark_dirty(&partition(0), 5);
        tracker.mark_dirty(&partition(10), 3);
        tracker.mark_dirty(&partition(0), 7);
        assert_eq!(tracker.oldest_dirty_segment(), Some(3));
        assert_eq!(tracker.dirty_partitions(), 2);
    }

    #[test]
    fn test_flush_releases_segments() {
        let tracker = DirtySegmentTracker::new();
        tracker.mark_dirty(&partition(0), 1);
        tracker.mark_dirty(&partition(10), 2);

        tracker.set_first_dirty(&partition(0), None);
        assert_eq!(tracker.oldest_dirty_segment(), Some(2));

        tracker.set_first_dirty(&partition(10), Some(4));
        assert_eq!(tracker.oldest_dirty_segment(), Some(4));

        tracker.set_first_dirty(&partition(10), None);
        assert_eq!(tracker.oldest_dirty_segment(), None);
    }

    #[test]
    fn test_concurrent_marks_keep_oldest_segment() {
        let tracker = std::sync::Arc::new(DirtySegmentTracker::new());
        let handles: Vec<_> = (0..4u64)
            .map(|thread| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for segment in (1..100u64).rev() {
                        tracker.mark_dirty(&partition((segment % 8) as i64 * 10), segment + thread);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.dirty_partitions(), 8);
        assert_eq!(tracker.oldest_dirty_segment(), Some(1));
    }
}
