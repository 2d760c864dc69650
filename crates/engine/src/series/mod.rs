//! Time series partition storage.
//!
//! Incoming records are delta-encoded into an immutable, slab-backed
//! [`MemTimeSeries`]. Full buffers are swapped out and appended verbatim to
//! the partition's [`TimeSeriesFile`] by the single [`FlushManager`] thread.
//! Reads decode the file content followed by the buffered tail as a single
//! record stream.

pub mod file;
pub mod flush;
pub mod layout;
pub mod mem;
pub mod partition;

pub use file::{FileMetaData, TimeSeriesFile, FILE_FORMAT_VERSION};
pub use flush::{FlushManager, FlushStats, FlushTicket};
pub use layout::{PartitionLayout, DATABASES_FILE, PARTITIONS_FILE, TIME_SERIES_FILE};
pub use mem::MemTimeSeries;
pub use partition::{
    NoopListener, PartitionListener, PartitionMetaData, PartitionStats, TimeSeriesPartition,
};
