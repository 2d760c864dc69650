//! Time units, time ranges and partition granularity.

use crate::error::{Error, Result};
use std::fmt;

/// Unit in which the timestamps of a time series are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TimeUnit {
    /// Nanoseconds since the epoch.
    Nanoseconds,
    /// Microseconds since the epoch.
    Microseconds,
    /// Milliseconds since the epoch.
    #[default]
    Milliseconds,
    /// Seconds since the epoch.
    Seconds,
}

impl TimeUnit {
    /// Number of nanoseconds in one unit.
    pub fn nanos(self) -> i64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
        }
    }

    /// Converts `value` expressed in this unit into `target`, truncating
    /// toward negative infinity and saturating on overflow.
    pub fn convert(self, value: i64, target: TimeUnit) -> i64 {
        let (from, to) = (self.nanos(), target.nanos());
        if from >= to {
            value.saturating_mul(from / to)
        } else {
            value.div_euclid(to / from)
        }
    }

    /// `value` in seconds.
    pub fn to_seconds(self, value: i64) -> i64 {
        self.convert(value, TimeUnit::Seconds)
    }

    /// `value` in milliseconds.
    pub fn to_millis(self, value: i64) -> i64 {
        self.convert(value, TimeUnit::Milliseconds)
    }

    /// `value` in microseconds.
    pub fn to_micros(self, value: i64) -> i64 {
        self.convert(value, TimeUnit::Microseconds)
    }

    /// `value` in nanoseconds.
    pub fn to_nanos(self, value: i64) -> i64 {
        self.convert(value, TimeUnit::Nanoseconds)
    }

    /// Serialized code.
    pub fn code(self) -> u8 {
        match self {
            TimeUnit::Nanoseconds => 0,
            TimeUnit::Microseconds => 1,
            TimeUnit::Milliseconds => 2,
            TimeUnit::Seconds => 3,
        }
    }

    /// Parses a serialized code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(TimeUnit::Nanoseconds),
            1 => Ok(TimeUnit::Microseconds),
            2 => Ok(TimeUnit::Milliseconds),
            3 => Ok(TimeUnit::Seconds),
            other => Err(Error::corrupted(format!("unknown time unit code {other}"))),
        }
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
}

impl TimeRange {
    /// Creates `[start, end)`.
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Range covering every timestamp.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Returns `true` if `timestamp` lies within the range.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Returns `true` if both ranges share at least one timestamp.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns `true` if the range holds no timestamp.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Duration of the partitions of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PartitionGranularity {
    /// One partition per hour.
    Hourly,
    /// One partition per day.
    #[default]
    Daily,
}

impl PartitionGranularity {
    /// Partition length in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            PartitionGranularity::Hourly => 3_600,
            PartitionGranularity::Daily => 86_400,
        }
    }

    /// Partition length expressed in `unit`.
    pub fn duration_in(self, unit: TimeUnit) -> i64 {
        TimeUnit::Seconds.convert(self.seconds(), unit)
    }

    /// Range of the partition holding `timestamp`, both expressed in `unit`.
    pub fn range_of(self, timestamp: i64, unit: TimeUnit) -> TimeRange {
        let duration = self.duration_in(unit);
        let start = timestamp.div_euclid(duration) * duration;
        TimeRange::new(start, start.saturating_add(duration))
    }

    /// Serialized code.
    pub fn code(self) -> u8 {
        match self {
            PartitionGranularity::Hourly => 0,
            PartitionGranularity::Daily => 1,
        }
    }

    /// Parses a serialized code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PartitionGranularity::Hourly),
            1 => Ok(PartitionGranularity::Daily),
            other => Err(Error::corrupted(format!(
                "unknown partition granularity code {other}"
            ))),
        }
    }
}
