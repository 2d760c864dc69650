//! Key and value codecs of the metadata trees.

use crate::btree::KeyValueCodec;
use crate::error::Result;
use crate::io::{compute_string_size, ByteReader, ByteWriter};
use crate::model::{DatabaseDefinition, PartitionId, TimeSeriesDefinition};
use crate::series::PartitionMetaData;

/// Key of the time series tree: database name, then time series name.
pub type TimeSeriesKey = (String, String);

/// `databases.b3`: database name to definition.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatabaseCodec;

impl KeyValueCodec<String, DatabaseDefinition> for DatabaseCodec {
    fn compute_key_size(&self, key: &String) -> usize {
        compute_string_size(key)
    }

    fn write_key(&self, writer: &mut dyn ByteWriter, key: &String) -> Result<()> {
        writer.write_string(key)
    }

    fn read_key(&self, reader: &mut dyn ByteReader) -> Result<String> {
        reader.read_string()
    }

    fn compute_value_size(&self, value: &DatabaseDefinition) -> usize {
        value.compute_size()
    }

    fn write_value(&self, writer: &mut dyn ByteWriter, value: &DatabaseDefinition) -> Result<()> {
        value.write_to(writer)
    }

    fn read_value(&self, reader: &mut dyn ByteReader) -> Result<DatabaseDefinition> {
        DatabaseDefinition::read_from(reader)
    }
}

/// `timeseries.b3`: (database, name) to definition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeSeriesCodec;

impl KeyValueCodec<TimeSeriesKey, TimeSeriesDefinition> for TimeSeriesCodec {
    fn compute_key_size(&self, key: &TimeSeriesKey) -> usize {
        compute_string_size(&key.0) + compute_string_size(&key.1)
    }

    fn write_key(&self, writer: &mut dyn ByteWriter, key: &TimeSeriesKey) -> Result<()> {
        writer.write_string(&key.0)?;
        writer.write_string(&key.1)
    }

    fn read_key(&self, reader: &mut dyn ByteReader) -> Result<TimeSeriesKey> {
        let database = reader.read_string()?;
        let series = reader.read_string()?;
        Ok((database, series))
    }

    fn compute_value_size(&self, value: &TimeSeriesDefinition) -> usize {
        value.compute_size()
    }

    fn write_value(&self, writer: &mut dyn ByteWriter, value: &TimeSeriesDefinition) -> Result<()> {
        value.write_to(writer)
    }

    fn read_value(&self, reader: &mut dyn ByteReader) -> Result<TimeSeriesDefinition> {
        TimeSeriesDefinition::read_from(reader)
    }
}

/// `partitions.b3`: partition id to partition metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PartitionCodec;

impl KeyValueCodec<PartitionId, PartitionMetaData> for PartitionCodec {
    fn compute_key_size(&self, key: &PartitionId) -> usize {
        key.compute_size()
    }

    fn write_key(&self, writer: &mut dyn ByteWriter, key: &PartitionId) -> Result<()> {
        key.write_to(writer)
    }

    fn read_key(&self, reader: &mut dyn ByteReader) -> Result<PartitionId> {
        PartitionId::read_from(reader)
    }

    fn compute_value_size(&self, value: &PartitionMetaData) -> usize {
        value.compute_size()
    }

    fn write_value(&self, writer: &mut dyn ByteWriter, value: &PartitionMetaData) -> Result<()> {
        value.write_to(writer)
    }

    fn read_value(&self, reader: &mut dyn ByteReader) -> Result<PartitionMetaData> {
        PartitionMetaData::read_from(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ReadBuffer, WriteBuffer};
    use crate::model::{FieldType, RecordTypeDefinition, TimeRange};

    fn round_trip<K, V, C>(codec: &C, key: &K, value: &V) -> (K, V)
    where
        C: KeyValueCodec<K, V>,
    {
        let mut writer = WriteBuffer::new();
        codec.write_key(&mut writer, key).unwrap();
        assert_eq!(writer.len(), codec.compute_key_size(key));
        codec.write_value(&mut writer, value).unwrap();
        assert_eq!(
            writer.len(),
            codec.compute_key_size(key) + codec.compute_value_size(value)
        );
        let mut reader = ReadBuffer::new(writer.freeze());
        let key = codec.read_key(&mut reader).unwrap();
        let value = codec.read_value(&mut reader).unwrap();
        assert!(!reader.is_readable());
        (key, value)
    }

    #[test]
    fn test_time_series_codec() {
        let definition = TimeSeriesDefinition::new("metrics", "cpu").with_record_type(
            RecordTypeDefinition::new("load").with_field("value", FieldType::Decimal),
        );
        let key = ("metrics".to_string(), "cpu".to_string());
        let (decoded_key, decoded) = round_trip(&TimeSeriesCodec, &key, &definition);
        assert_eq!(decoded_key, key);
        assert_eq!(decoded, definition);
    }

    #[test]
    fn test_partition_codec() {
        let id = PartitionId::new("metrics", "cpu", TimeRange::new(0, 86_400_000));
        let mut metadata = PartitionMetaData::new(id.range);
        metadata.file_size = 4_096;
        let (decoded_id, decoded) = round_trip(&PartitionCodec, &id, &metadata);
        assert_eq!(decoded_id, id);
        assert_eq!(decoded, metadata);
    }
}
