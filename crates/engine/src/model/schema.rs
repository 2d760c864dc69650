//! Database and time series definitions.

use super::field::FieldType;
use super::time::{PartitionGranularity, TimeRange, TimeUnit};
use crate::error::{Error, Result};
use crate::io::{compute_string_size, varint, ByteReader, ByteWriter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the timestamp field every record type starts with.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Maximum number of fields in a record type, timestamp included.
pub const MAX_FIELDS: usize = 64;

/// Maximum number of record types in a time series.
pub const MAX_RECORD_TYPES: usize = 127;

/// Maximum length of a database, time series, record type or field name.
pub const MAX_NAME_LENGTH: usize = 128;

/// Checks that `name` is non-empty and only uses ASCII alphanumerics, `_`,
/// `-` and `.`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidSchema(format!(
            "{kind} name must be 1 to {MAX_NAME_LENGTH} characters long"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::InvalidSchema(format!(
            "{kind} name {name:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Definition of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDefinition {
    name: String,
    creation_time: i64,
}

impl DatabaseDefinition {
    /// Creates a definition stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self::with_creation_time(name, creation_time)
    }

    /// Creates a definition with an explicit creation time in milliseconds.
    pub fn with_creation_time(name: impl Into<String>, creation_time: i64) -> Self {
        Self {
            name: name.into(),
            creation_time,
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time in milliseconds since the epoch.
    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    /// Checks the name.
    pub fn validate(&self) -> Result<()> {
        validate_name("database", &self.name)
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        compute_string_size(&self.name) + varint::compute_i64_size(self.creation_time)
    }

    /// Serializes the definition.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_var_i64(self.creation_time)
    }

    /// Deserializes a definition.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let name = reader.read_string()?;
        let creation_time = reader.read_var_i64()?;
        Ok(Self {
            name,
            creation_time,
        })
    }
}

/// A named, typed field of a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
}

/// A record type: a timestamp followed by typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTypeDefinition {
    name: String,
    fields: Vec<FieldDefinition>,
}

impl RecordTypeDefinition {
    /// Creates a record type holding only the timestamp field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![FieldDefinition {
                name: TIMESTAMP_FIELD.to_string(),
                field_type: FieldType::Timestamp,
            }],
        }
    }

    /// Appends a field.
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.into(),
            field_type,
        });
        self
    }

    /// Record type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields, the timestamp first.
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    /// Index of the field called `name`.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn validate(&self) -> Result<()> {
        validate_name("record type", &self.name)?;
        if self.fields.len() > MAX_FIELDS {
            return Err(Error::InvalidSchema(format!(
                "record type {} has {} fields, at most {MAX_FIELDS} allowed",
                self.name,
                self.fields.len()
            )));
        }
        match self.fields.first() {
            Some(first) if first.field_type == FieldType::Timestamp => {}
            _ => {
                return Err(Error::InvalidSchema(format!(
                    "record type {} must start with a timestamp field",
                    self.name
                )))
            }
        }
        for (index, field) in self.fields.iter().enumerate() {
            validate_name("field", &field.name)?;
            if self.fields[..index].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidSchema(format!(
                    "record type {} defines field {} twice",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }

    fn compute_size(&self) -> usize {
        compute_string_size(&self.name)
            + varint::compute_u64_size(self.fields.len() as u64)
            + self
                .fields
                .iter()
                .map(|f| compute_string_size(&f.name) + 1)
                .sum::<usize>()
    }

    fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_var_usize(self.fields.len())?;
        for field in &self.fields {
            writer.write_string(&field.name)?;
            writer.write_u8(field.field_type.code())?;
        }
        Ok(())
    }

    fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let name = reader.read_string()?;
        let count = reader.read_var_usize()?;
        if count > MAX_FIELDS {
            return Err(Error::corrupted(format!("record type with {count} fields")));
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.read_string()?;
            let field_type = FieldType::from_code(reader.read_u8()?)?;
            fields.push(FieldDefinition { name, field_type });
        }
        Ok(Self { name, fields })
    }
}

/// Definition of a time series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesDefinition {
    database: String,
    name: String,
    time_unit: TimeUnit,
    granularity: PartitionGranularity,
    record_types: Vec<RecordTypeDefinition>,
}

impl TimeSeriesDefinition {
    /// Creates a definition with millisecond timestamps, daily partitions and
    /// no record type.
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            time_unit: TimeUnit::default(),
            granularity: PartitionGranularity::default(),
            record_types: Vec::new(),
        }
    }

    /// Sets the timestamp unit.
    pub fn with_time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Sets the partition granularity.
    pub fn with_granularity(mut self, granularity: PartitionGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Appends a record type.
    pub fn with_record_type(mut self, record_type: RecordTypeDefinition) -> Self {
        self.record_types.push(record_type);
        self
    }

    /// Owning database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Time series name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timestamp unit.
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Partition granularity.
    pub fn granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    /// Record types, indexed by record type code.
    pub fn record_types(&self) -> &[RecordTypeDefinition] {
        &self.record_types
    }

    /// Record type with code `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordSet`] for an unknown code.
    pub fn record_type(&self, index: usize) -> Result<&RecordTypeDefinition> {
        self.record_types.get(index).ok_or_else(|| {
            Error::invalid_record_set(format!(
                "time series {} has no record type {index}",
                self.name
            ))
        })
    }

    /// Code of the record type called `name`.
    pub fn record_type_index(&self, name: &str) -> Option<usize> {
        self.record_types.iter().position(|r| r.name == name)
    }

    /// Range of the partition holding `timestamp`.
    pub fn partition_range(&self, timestamp: i64) -> TimeRange {
        self.granularity.range_of(timestamp, self.time_unit)
    }

    /// Checks names, the record type count and every record type.
    pub fn validate(&self) -> Result<()> {
        validate_name("database", &self.database)?;
        validate_name("time series", &self.name)?;
        if self.record_types.is_empty() || self.record_types.len() > MAX_RECORD_TYPES {
            return Err(Error::InvalidSchema(format!(
                "time series {} must define 1 to {MAX_RECORD_TYPES} record types",
                self.name
            )));
        }
        for (index, record_type) in self.record_types.iter().enumerate() {
            record_type.validate()?;
            if self.record_types[..index]
                .iter()
                .any(|r| r.name == record_type.name)
            {
                return Err(Error::InvalidSchema(format!(
                    "time series {} defines record type {} twice",
                    self.name, record_type.name
                )));
            }
        }
        Ok(())
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        compute_string_size(&self.database)
            + compute_string_size(&self.name)
            + 2
            + varint::compute_u64_size(self.record_types.len() as u64)
            + self
                .record_types
                .iter()
                .map(RecordTypeDefinition::compute_size)
                .sum::<usize>()
    }

    /// Serializes the definition.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        writer.write_string(&self.database)?;
        writer.write_string(&self.name)?;
        writer.write_u8(self.time_unit.code())?;
        writer.write_u8(self.granularity.code())?;
        writer.write_var_usize(self.record_types.len())?;
        for record_type in &self.record_types {
            record_type.write_to(writer)?;
        }
        Ok(())
    }

    /// Deserializes a definition.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let database = reader.read_string()?;
        let name = reader.read_string()?;
        let time_unit = TimeUnit::from_code(reader.read_u8()?)?;
        let granularity = PartitionGranularity::from_code(reader.read_u8()?)?;
        let count = reader.read_var_usize()?;
        if count > MAX_RECORD_TYPES {
            return Err(Error::corrupted(format!("time series with {count} record types")));
        }
        let mut record_types = Vec::with_capacity(count);
        for _ in 0..count {
            record_types.push(RecordTypeDefinition::read_from(reader)?);
        }
        Ok(Self {
            database,
            name,
            time_unit,
            granularity,
            record_types,
        })
    }
}
