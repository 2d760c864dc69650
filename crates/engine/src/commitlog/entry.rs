//! Payloads of the commit log entries.
//!
//! ```text
//! [op u8 = 1][database definition]
//! [op u8 = 2][time series definition]
//! [op u8 = 3][database][series][range start][range end][varint length][records]
//! ```

use crate::error::{Error, Result};
use crate::io::{ByteReader, ByteWriter, ReadBuffer, WriteBuffer};
use crate::model::{DatabaseDefinition, PartitionId, Record, TimeSeriesDefinition};
use bytes::Bytes;

const CREATE_DATABASE: u8 = 1;
const CREATE_TIME_SERIES: u8 = 2;
const WRITE: u8 = 3;

/// A mutation recorded in the commit log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// Creation of a database.
    CreateDatabase(DatabaseDefinition),
    /// Creation of a time series.
    CreateTimeSeries(TimeSeriesDefinition),
    /// Records written to one partition, serialized as they were received.
    Write {
        /// Target partition.
        partition: PartitionId,
        /// Serialized records.
        records: Bytes,
    },
}

impl LogEntry {
    /// Builds a write entry from `records`.
    pub fn write(partition: PartitionId, records: &[Record]) -> Result<Self> {
        let size = records.iter().map(Record::compute_size).sum();
        let mut buffer = WriteBuffer::with_capacity(size);
        for record in records {
            record.write_to(&mut buffer)?;
        }
        Ok(LogEntry::Write {
            partition,
            records: buffer.freeze(),
        })
    }

    /// Serializes the entry.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buffer = WriteBuffer::new();
        match self {
            LogEntry::CreateDatabase(definition) => {
                buffer.write_u8(CREATE_DATABASE)?;
                definition.write_to(&mut buffer)?;
            }
            LogEntry::CreateTimeSeries(definition) => {
                buffer.write_u8(CREATE_TIME_SERIES)?;
                definition.write_to(&mut buffer)?;
            }
            LogEntry::Write { partition, records } => {
                buffer.write_u8(WRITE)?;
                partition.write_to(&mut buffer)?;
                buffer.write_var_usize(records.len())?;
                buffer.write_all(records)?;
            }
        }
        Ok(buffer.freeze())
    }

    /// Deserializes an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on an unknown op code or trailing bytes.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut reader = ReadBuffer::new(payload);
        let entry = match reader.read_u8()? {
            CREATE_DATABASE => LogEntry::CreateDatabase(DatabaseDefinition::read_from(&mut reader)?),
            CREATE_TIME_SERIES => {
                LogEntry::CreateTimeSeries(TimeSeriesDefinition::read_from(&mut reader)?)
            }
            WRITE => {
                let partition = PartitionId::read_from(&mut reader)?;
                let length = reader.read_var_usize()?;
                LogEntry::Write {
                    partition,
                    records: reader.slice(length)?,
                }
            }
            op => return Err(Error::corrupted(format!("unknown commit log op {op}"))),
        };
        if reader.is_readable() {
            return Err(Error::corrupted(format!(
                "{} trailing bytes in commit log entry",
                reader.remaining()
            )));
        }
        Ok(entry)
    }
}

/// Decodes the records of a write entry.
pub fn decode_records(records: Bytes, definition: &TimeSeriesDefinition) -> Result<Vec<Record>> {
    let mut reader = ReadBuffer::new(records);
    let mut decoded = Vec::new();
    while reader.is_readable() {
        decoded.push(Record::read_from(&mut reader, definition)?);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldType, RecordTypeDefinition, TimeRange};

    fn definition() -> TimeSeriesDefinition {
        TimeSeriesDefinition::new("db", "cpu").with_record_type(
            RecordTypeDefinition::new("sample").with_field("value", FieldType::Long),
        )
    }

    #[test]
    fn test_write_entry() {
        let records = vec![
            Record::new(0, vec![Field::Timestamp(10), Field::Long(5)]),
            Record::new_delta(0, vec![Field::Timestamp(2), Field::Long(-1)]),
        ];
        let partition = PartitionId::new("db", "cpu", TimeRange::new(0, 100));
        let entry = LogEntry::write(partition.clone(), &records).unwrap();
        let decoded = LogEntry::decode(entry.encode().unwrap()).unwrap();
        let LogEntry::Write {
            partition: decoded_partition,
            records: bytes,
        } = decoded
        else {
            panic!("expected a write entry");
        };
        assert_eq!(decoded_partition, partition);
        assert_eq!(decode_records(bytes, &definition()).unwrap(), records);
    }

    #[test]
    fn test_definition_entries() {
        let entry = LogEntry::CreateTimeSeries(definition());
        assert_eq!(LogEntry::decode(entry.encode().unwrap()).unwrap(), entry);
        let entry = LogEntry::CreateDatabase(DatabaseDefinition::with_creation_time("db", 3));
        assert_eq!(LogEntry::decode(entry.encode().unwrap()).unwrap(), entry);
    }

    #[test]
    fn test_unknown_op() {
        assert!(matches!(
            LogEntry::decode(Bytes::from_static(&[9])),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut payload = LogEntry::CreateDatabase(DatabaseDefinition::new("db"))
            .encode()
            .unwrap()
            .to_vec();
        payload.push(0);
        assert!(matches!(
            LogEntry::decode(Bytes::from(payload)),
            Err(Error::Corrupted(_))
        ));
    }
}
