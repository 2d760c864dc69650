//! Decoding of delta-encoded record streams.

use super::record::Record;
use super::schema::TimeSeriesDefinition;
use super::time::TimeRange;
use crate::error::{Error, Result};
use crate::io::ByteReader;
use std::sync::Arc;

/// Boxed stream of absolute records, as returned by partition and engine reads.
pub type RecordIterator = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Returns an iterator yielding nothing.
pub fn empty_iterator() -> RecordIterator {
    Box::new(std::iter::empty())
}

/// Turns a stream of absolute and delta records into absolute records.
///
/// The decoder keeps the last absolute record of every record type; a delta
/// is added to it, an absolute record replaces it. Records whose timestamp
/// falls outside `range` are decoded (to keep the state current) but not
/// returned. Iteration stops after the first error.
pub struct RecordDecoder<R> {
    reader: R,
    definition: Arc<TimeSeriesDefinition>,
    range: TimeRange,
    last: Vec<Option<Record>>,
    failed: bool,
}

impl<R: ByteReader> RecordDecoder<R> {
    /// Creates a decoder returning every record.
    pub fn new(reader: R, definition: Arc<TimeSeriesDefinition>) -> Self {
        Self::with_range(reader, definition, TimeRange::all())
    }

    /// Creates a decoder returning the records within `range`.
    pub fn with_range(reader: R, definition: Arc<TimeSeriesDefinition>, range: TimeRange) -> Self {
        let types = definition.record_types().len();
        Self {
            reader,
            definition,
            range,
            last: vec![None; types],
            failed: false,
        }
    }

    /// Consumes the decoder, returning the last absolute record of every
    /// record type seen so far.
    pub fn into_last_records(self) -> Vec<Option<Record>> {
        self.last
    }

    fn decode_next(&mut self) -> Result<Option<Record>> {
        while self.reader.is_readable() {
            let record = Record::read_from(&mut self.reader, &self.definition)?;
            let absolute = resolve(&mut self.last, record)
                .map_err(|e| Error::corrupted(format!("undecodable record stream: {e}")))?;
            if self.range.contains(absolute.timestamp()?) {
                return Ok(Some(absolute));
            }
        }
        Ok(None)
    }
}

impl<R: ByteReader> Iterator for RecordDecoder<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decode_next() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Applies `record` to the per-type state and returns its absolute form.
///
/// # Errors
///
/// Returns [`Error::InvalidRecordSet`] for a delta with no previous record of
/// its type.
pub(crate) fn resolve(last: &mut [Option<Record>], record: Record) -> Result<Record> {
    let slot = last
        .get_mut(record.type_index() as usize)
        .ok_or_else(|| Error::invalid_record_set(format!("unknown record type {}", record.type_index())))?;
    let absolute = match (slot.as_ref(), record.is_delta()) {
        (_, false) => record,
        (Some(previous), true) => previous.add(&record)?,
        (None, true) => {
            return Err(Error::invalid_record_set(format!(
                "first record of type {} is a delta",
                record.type_index()
            )))
        }
    };
    *slot = Some(absolute.clone());
    Ok(absolute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ChunkedReader, WriteBuffer};
    use crate::model::{Decimal, Field, FieldType, RecordTypeDefinition};

    fn definition() -> Arc<TimeSeriesDefinition> {
        Arc::new(
            TimeSeriesDefinition::new("db", "ts")
                .with_record_type(RecordTypeDefinition::new("trade").with_field("price", FieldType::Decimal))
                .with_record_type(RecordTypeDefinition::new("tick").with_field("count", FieldType::Integer)),
        )
    }

    fn trade(timestamp: i64, mantissa: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(timestamp), Field::Decimal(Decimal::new(mantissa, -1))])
    }

    fn tick(timestamp: i64, count: i32) -> Record {
        Record::new(1, vec![Field::Timestamp(timestamp), Field::Integer(count)])
    }

    fn encode(records: &[Record]) -> bytes::Bytes {
        let mut writer = WriteBuffer::new();
        for record in records {
            record.write_to(&mut writer).unwrap();
        }
        writer.freeze()
    }

    #[test]
    fn test_decodes_interleaved_types() {
        let stream = [
            trade(100, 104),
            tick(100, 1),
            trade(200, 146).subtract(&trade(100, 104)).unwrap(),
            tick(300, 4).subtract(&tick(100, 1)).unwrap(),
        ];
        let decoded: Vec<Record> = RecordDecoder::new(ChunkedReader::new([encode(&stream)]), definition())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, vec![trade(100, 104), tick(100, 1), trade(200, 146), tick(300, 4)]);
    }

    #[test]
    fn test_range_filter_keeps_state() {
        let stream = [
            trade(100, 10),
            trade(200, 20).subtract(&trade(100, 10)).unwrap(),
            trade(300, 30).subtract(&trade(200, 20)).unwrap(),
        ];
        let decoded: Vec<Record> = RecordDecoder::with_range(
            ChunkedReader::new([encode(&stream)]),
            definition(),
            TimeRange::new(250, 400),
        )
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(decoded, vec![trade(300, 30)]);
    }

    #[test]
    fn test_leading_delta_is_corruption() {
        let delta = trade(200, 20).subtract(&trade(100, 10)).unwrap();
        let mut decoder = RecordDecoder::new(ChunkedReader::new([encode(&[delta])]), definition());
        assert!(matches!(decoder.next(), Some(Err(Error::Corrupted(_)))));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn test_decoding_across_chunks() {
        let bytes = encode(&[trade(100, 1), trade(150, 2).subtract(&trade(100, 1)).unwrap()]);
        let (head, tail) = (bytes.slice(..3), bytes.slice(3..));
        let decoded: Vec<Record> = RecordDecoder::new(ChunkedReader::new([head, tail]), definition())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], trade(150, 2));
    }
}
