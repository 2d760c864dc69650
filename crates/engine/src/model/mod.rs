//! Data model: decimals, fields, records, definitions and time ranges.

pub mod decimal;
pub mod field;
pub mod iterator;
pub mod record;
pub mod schema;
pub mod time;

pub use decimal::Decimal;
pub use field::{Field, FieldType};
pub use iterator::{empty_iterator, RecordDecoder, RecordIterator};
pub use record::{Record, DELTA_FLAG};
pub use schema::{
    DatabaseDefinition, FieldDefinition, RecordTypeDefinition, TimeSeriesDefinition,
};
pub use time::{PartitionGranularity, TimeRange, TimeUnit};

use crate::error::Result;
use crate::io::{compute_string_size, varint, ByteReader, ByteWriter};
use std::fmt;

/// Identity of a partition: one time series restricted to one time range.
///
/// Ordering is by database, then series, then range, so that the partitions
/// of a time series are contiguous and sorted by time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    /// Database name.
    pub database: String,
    /// Time series name.
    pub series: String,
    /// Time range covered by the partition.
    pub range: TimeRange,
}

impl PartitionId {
    /// Creates a partition id.
    pub fn new(database: impl Into<String>, series: impl Into<String>, range: TimeRange) -> Self {
        Self {
            database: database.into(),
            series: series.into(),
            range,
        }
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        compute_string_size(&self.database)
            + compute_string_size(&self.series)
            + varint::compute_i64_size(self.range.start)
            + varint::compute_i64_size(self.range.end)
    }

    /// Serializes the id.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_string(&self.database)?;
        writer.write_string(&self.series)?;
        writer.write_var_i64(self.range.start)?;
        writer.write_var_i64(self.range.end)
    }

    /// Deserializes an id.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let database = reader.read_string()?;
        let series = reader.read_string()?;
        let start = reader.read_var_i64()?;
        let end = reader.read_var_i64()?;
        Ok(Self::new(database, series, TimeRange::new(start, end)))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.database, self.series, self.range)
    }
}
