//! Database, time series and partition managers.
//!
//! Each manager is a trait with a default implementation backed by a
//! B+Tree metadata file, and caching decorators layered on top:
//!
//! ```text
//! WriteCachingPartitionManager   weight + expiry bound, flush on eviction
//!   ReadCachingPartitionManager  entry-count bound
//!     GlobalPartitionCache       weak references, one instance per partition
//!       DefaultPartitionManager  partitions.b3 + partition files + flush thread
//!
//! CachingDatabaseManager   -> DefaultDatabaseManager   (databases.b3)
//! CachingTimeSeriesManager -> DefaultTimeSeriesManager (timeseries.b3)
//! ```

pub mod cache;
pub mod codec;
pub mod database;
pub mod partition;
pub mod timeseries;

pub use cache::{
    CacheStats, GlobalPartitionCache, ReadCachingPartitionManager, RemovalCause,
    WriteCachingPartitionManager,
};
pub use codec::{DatabaseCodec, PartitionCodec, TimeSeriesCodec, TimeSeriesKey};
pub use database::{CachingDatabaseManager, DefaultDatabaseManager};
pub use partition::DefaultPartitionManager;
pub use timeseries::{CachingTimeSeriesManager, DefaultTimeSeriesManager};

use crate::error::Result;
use crate::model::{DatabaseDefinition, PartitionId, TimeRange, TimeSeriesDefinition};
use crate::series::{FlushTicket, TimeSeriesPartition};
use std::sync::Arc;

/// Access to the database definitions.
pub trait DatabaseManager: Send + Sync {
    /// Creates a database. Returns `false` if it already existed and
    /// `throw_if_exists` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateDatabase`](crate::Error::DuplicateDatabase)
    /// if it exists and `throw_if_exists` is set.
    fn create_database(&self, definition: DatabaseDefinition, throw_if_exists: bool) -> Result<bool>;

    /// Returns the definition of database `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDatabase`](crate::Error::UnknownDatabase).
    fn get_database(&self, name: &str) -> Result<Arc<DatabaseDefinition>>;

    /// Returns every database, sorted by name.
    fn list_databases(&self) -> Result<Vec<Arc<DatabaseDefinition>>>;
}

/// Access to the time series definitions.
pub trait TimeSeriesManager: Send + Sync {
    /// Creates a time series in an existing database. Returns `false` if it
    /// already existed and `throw_if_exists` is unset.
    fn create_time_series(
        &self,
        definition: TimeSeriesDefinition,
        throw_if_exists: bool,
    ) -> Result<bool>;

    /// Returns the definition of time series `name` of `database`.
    fn get_time_series(&self, database: &str, name: &str) -> Result<Arc<TimeSeriesDefinition>>;

    /// Returns the time series of `database`, sorted by name.
    fn list_time_series(&self, database: &str) -> Result<Vec<Arc<TimeSeriesDefinition>>>;
}

/// Access to the partitions of the time series.
pub trait PartitionManager: Send + Sync {
    /// Returns partition `id`, creating it if it does not exist yet.
    fn get_partition_for_write(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>>;

    /// Returns partition `id` if it exists.
    fn get_partition_for_read(
        &self,
        id: &PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Option<Arc<TimeSeriesPartition>>>;

    /// Ranges of the existing partitions of a time series overlapping
    /// `range`, in time order.
    fn partition_ranges(&self, database: &str, series: &str, range: &TimeRange)
        -> Result<Vec<TimeRange>>;

    /// Schedules a flush of `partition` if its buffer is full.
    fn flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<()>;

    /// Schedules an unconditional flush of `partition`.
    fn force_flush(&self, partition: &Arc<TimeSeriesPartition>) -> Result<FlushTicket>;

    /// Flushes every partition with buffered data and waits for completion.
    fn force_flush_all(&self) -> Result<()>;

    /// Bytes held by the buffers of every open partition.
    fn memory_usage(&self) -> usize;
}
