//! In-memory, delta-encoded write buffer of a partition.
//!
//! A [`MemTimeSeries`] is immutable: [`MemTimeSeries::write`] returns a new
//! buffer sharing the bytes of the previous one, so readers holding an older
//! value are never affected by later writes.

use crate::commitlog::WriteFuture;
use crate::error::{Error, Result};
use crate::io::{ChunkedReader, CompositeBuffer, SlabAllocator, WriteBuffer};
use crate::model::{Record, TimeRange, TimeSeriesDefinition};
use std::sync::Arc;

/// Delta-encoded records of one partition not yet written to its file.
#[derive(Debug, Clone)]
pub struct MemTimeSeries {
    definition: Arc<TimeSeriesDefinition>,
    range: TimeRange,
    buffer: CompositeBuffer,
    /// Last absolute record of every record type, including the ones already
    /// flushed; deltas are computed against it.
    last: Arc<Vec<Option<Record>>>,
    record_count: usize,
    first_write: Option<WriteFuture>,
    last_write: Option<WriteFuture>,
}

impl MemTimeSeries {
    /// Creates an empty buffer for a partition with no previous record.
    pub fn new(definition: Arc<TimeSeriesDefinition>, range: TimeRange) -> Self {
        let types = definition.record_types().len();
        Self::with_last_records(definition, range, vec![None; types])
    }

    /// Creates an empty buffer continuing after the records `last`, typically
    /// decoded from the partition file.
    pub fn with_last_records(
        definition: Arc<TimeSeriesDefinition>,
        range: TimeRange,
        last: Vec<Option<Record>>,
    ) -> Self {
        Self {
            definition,
            range,
            buffer: CompositeBuffer::new(),
            last: Arc::new(last),
            record_count: 0,
            first_write: None,
            last_write: None,
        }
    }

    /// Returns an empty buffer that keeps the last records of this one, used
    /// to receive the writes arriving while this one is flushed.
    pub fn continuation(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            range: self.range,
            buffer: CompositeBuffer::new(),
            last: self.last.clone(),
            record_count: 0,
            first_write: None,
            last_write: None,
        }
    }

    /// Encodes `records` after the current content and returns the new buffer.
    ///
    /// Delta records are stored as they are. An absolute record is stored as
    /// its delta against the last record of its type, unless that delta does
    /// not restore the record exactly (NaN or overflowing decimals), in which
    /// case it is stored absolute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordSet`] and leaves `self` untouched when a
    /// record does not match the definition, the first record of a type is a
    /// delta, a timestamp goes backward or falls outside the partition range.
    pub fn write(
        &self,
        allocator: &SlabAllocator,
        records: &[Record],
        future: WriteFuture,
    ) -> Result<MemTimeSeries> {
        self.write_with(allocator, records, || Ok(future))
    }

    /// Like [`write`](Self::write), but obtains the write future from `log`
    /// once the records are known to be valid. Nothing is logged for a
    /// rejected record set.
    pub fn write_with<F>(
        &self,
        allocator: &SlabAllocator,
        records: &[Record],
        log: F,
    ) -> Result<MemTimeSeries>
    where
        F: FnOnce() -> Result<WriteFuture>,
    {
        let (bytes, last) = self.encode(records)?;
        let future = log()?;
        let chunk = allocator.copy(bytes.as_slice());
        Ok(Self {
            definition: self.definition.clone(),
            range: self.range,
            buffer: self.buffer.append(chunk),
            last: Arc::new(last),
            record_count: self.record_count + records.len(),
            first_write: self.first_write.clone().or_else(|| Some(future.clone())),
            last_write: Some(future),
        })
    }

    fn encode(&self, records: &[Record]) -> Result<(WriteBuffer, Vec<Option<Record>>)> {
        let mut last = self.last.as_ref().clone();
        let mut writer = WriteBuffer::new();
        for record in records {
            record.validate(&self.definition)?;
            let slot = &mut last[record.type_index() as usize];
            let (stored, absolute) = match slot.as_ref() {
                None if record.is_delta() => {
                    return Err(Error::invalid_record_set(format!(
                        "first record of type {} is a delta",
                        record.type_index()
                    )))
                }
                None => (record.clone(), record.clone()),
                Some(previous) => {
                    let absolute = if record.is_delta() {
                        previous.add(record)?
                    } else {
                        record.clone()
                    };
                    if absolute.timestamp()? < previous.timestamp()? {
                        return Err(Error::invalid_record_set(format!(
                            "record of type {} at {} is older than the last one at {}",
                            record.type_index(),
                            absolute.timestamp()?,
                            previous.timestamp()?
                        )));
                    }
                    let stored = if record.is_delta() {
                        record.clone()
                    } else {
                        let delta = record.subtract(previous)?;
                        if previous.add(&delta)? == *record {
                            delta
                        } else {
                            record.clone()
                        }
                    };
                    (stored, absolute)
                }
            };
            let timestamp = absolute.timestamp()?;
            if !self.range.contains(timestamp) {
                return Err(Error::invalid_record_set(format!(
                    "timestamp {} is outside partition {}",
                    timestamp, self.range
                )));
            }
            stored.write_to(&mut writer)?;
            *slot = Some(absolute);
        }
        Ok((writer, last))
    }

    /// Definition of the time series.
    pub fn definition(&self) -> &Arc<TimeSeriesDefinition> {
        &self.definition
    }

    /// Partition range.
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Encoded bytes.
    pub fn buffer(&self) -> &CompositeBuffer {
        &self.buffer
    }

    /// Reader over the encoded bytes.
    pub fn reader(&self) -> ChunkedReader {
        self.buffer.reader()
    }

    /// Size of the encoded bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if no record was written.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Number of records written.
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Returns `true` once the encoded size reaches `max_size`.
    pub fn is_full(&self, max_size: usize) -> bool {
        self.size() >= max_size
    }

    /// Last absolute record of every record type.
    pub fn last_records(&self) -> &[Option<Record>] {
        &self.last
    }

    /// Commit log write of the first record in this buffer.
    pub fn first_write(&self) -> Option<&WriteFuture> {
        self.first_write.as_ref()
    }

    /// Commit log write of the last record in this buffer.
    pub fn last_write(&self) -> Option<&WriteFuture> {
        self.last_write.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::ReplayPosition;
    use crate::model::{Decimal, Field, FieldType, RecordDecoder, RecordTypeDefinition};

    fn definition() -> Arc<TimeSeriesDefinition> {
        Arc::new(
            TimeSeriesDefinition::new("db", "ts").with_record_type(
                RecordTypeDefinition::new("trade")
                    .with_field("price", FieldType::Decimal)
                    .with_field("volume", FieldType::Long),
            ),
        )
    }

    fn trade(timestamp: i64, mantissa: i64, volume: i64) -> Record {
        Record::new(
            0,
            vec![
                Field::Timestamp(timestamp),
                Field::Decimal(Decimal::new(mantissa, -1)),
                Field::Long(volume),
            ],
        )
    }

    fn future(offset: u64) -> WriteFuture {
        WriteFuture::completed(ReplayPosition::new(1, offset))
    }

    fn decode(series: &MemTimeSeries) -> Vec<Record> {
        RecordDecoder::new(series.reader(), series.definition().clone())
            .collect::<Result<_>>()
            .unwrap()
    }

    fn create_test_series() -> (SlabAllocator, MemTimeSeries) {
        (SlabAllocator::new(4096), MemTimeSeries::new(definition(), TimeRange::new(0, 10_000)))
    }

    #[test]
    fn test_write_is_copy_on_write() {
        let (allocator, empty) = create_test_series();
        let one = empty.write(&allocator, &[trade(100, 104, 5)], future(10)).unwrap();
        let two = one.write(&allocator, &[trade(200, 146, 7)], future(20)).unwrap();

        assert!(empty.is_empty());
        assert_eq!(one.record_count(), 1);
        assert_eq!(two.record_count(), 2);
        assert_eq!(decode(&one), vec![trade(100, 104, 5)]);
        assert_eq!(decode(&two), vec![trade(100, 104, 5), trade(200, 146, 7)]);
        assert_eq!(two.first_write().unwrap().position().offset, 10);
        assert_eq!(two.last_write().unwrap().position().offset, 20);
    }

    #[test]
    fn test_absolute_records_stored_as_deltas() {
        let (allocator, series) = create_test_series();
        let series = series
            .write(&allocator, &[trade(1_000, 104, 0), trade(1_500, 146, 0)], future(1))
            .unwrap();
        let mut reader = series.reader();
        let first = Record::read_from(&mut reader, series.definition()).unwrap();
        let second = Record::read_from(&mut reader, series.definition()).unwrap();
        assert!(!first.is_delta());
        assert!(second.is_delta());
        assert_eq!(second.field(1), Some(&Field::Decimal(Decimal::new(42, -1))));
        assert_eq!(series.last_records()[0], Some(trade(1_500, 146, 0)));
    }

    #[test]
    fn test_first_delta_rejected() {
        let (allocator, series) = create_test_series();
        let delta = trade(200, 1, 1).subtract(&trade(100, 0, 0)).unwrap();
        let result = series.write(&allocator, &[delta], future(1));
        assert!(matches!(result, Err(Error::InvalidRecordSet(_))));
        assert!(series.is_empty());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (allocator, series) = create_test_series();
        let series = series.write(&allocator, &[trade(500, 1, 1)], future(1)).unwrap();
        let result = series.write(&allocator, &[trade(499, 1, 1)], future(2));
        assert!(matches!(result, Err(Error::InvalidRecordSet(_))));
        assert_eq!(series.record_count(), 1);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let (allocator, series) = create_test_series();
        let result = series.write(&allocator, &[trade(10_000, 1, 1)], future(1));
        assert!(matches!(result, Err(Error::InvalidRecordSet(_))));
    }

    #[test]
    fn test_nan_transition_stored_absolute() {
        let (allocator, series) = create_test_series();
        let nan = Record::new(
            0,
            vec![Field::Timestamp(200), Field::Decimal(Decimal::NAN), Field::Long(0)],
        );
        let series = series
            .write(&allocator, &[trade(100, 104, 0), nan.clone(), trade(300, 5, 0)], future(1))
            .unwrap();
        assert_eq!(decode(&series), vec![trade(100, 104, 0), nan, trade(300, 5, 0)]);
    }

    #[test]
    fn test_continuation_keeps_last_records() {
        let (allocator, series) = create_test_series();
        let flushed = series.write(&allocator, &[trade(100, 10, 1)], future(1)).unwrap();
        let next = flushed.continuation();
        assert!(next.is_empty());
        assert!(next.first_write().is_none());

        let delta = trade(200, 20, 2).subtract(&trade(100, 10, 1)).unwrap();
        let next = next.write(&allocator, &[delta], future(2)).unwrap();
        assert_eq!(next.last_records()[0], Some(trade(200, 20, 2)));
    }

    #[test]
    fn test_rejected_records_are_not_logged() {
        let (allocator, series) = create_test_series();
        let mut logged = false;
        let result = series.write_with(&allocator, &[trade(20_000, 1, 1)], || {
            logged = true;
            Ok(future(1))
        });
        assert!(matches!(result, Err(Error::InvalidRecordSet(_))));
        assert!(!logged);
    }

    #[test]
    fn test_is_full() {
        let (allocator, series) = create_test_series();
        let series = series.write(&allocator, &[trade(100, 104, 5)], future(1)).unwrap();
        assert!(series.is_full(series.size()));
        assert!(!series.is_full(series.size() + 1));
    }
}
