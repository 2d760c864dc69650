//! Records and their binary encoding.
//!
//! ```text
//! +-----------------------+----------------------+---------------------------+
//! | type (u8, 0x80=delta) | payload len (varint) | bitmap (varint) | fields  |
//! +-----------------------+----------------------+---------------------------+
//! ```
//!
//! Bit `i` of the bitmap is set when field `i` differs from its type's default
//! value; only those fields are written, in declaration order.

use super::field::Field;
use super::schema::TimeSeriesDefinition;
use crate::error::{Error, Result};
use crate::io::{varint, ByteReader, ByteWriter, ReadBuffer};
use std::fmt;

/// Flag set in the type byte of delta records.
pub const DELTA_FLAG: u8 = 0x80;

/// A record of a time series: a record type code, a delta flag and the field
/// values, the first of which is the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    type_index: u8,
    delta: bool,
    fields: Vec<Field>,
}

impl Record {
    /// Creates an absolute record.
    pub fn new(type_index: u8, fields: Vec<Field>) -> Self {
        Self {
            type_index,
            delta: false,
            fields,
        }
    }

    /// Creates a delta record whose fields are differences against the
    /// previous record of the same type.
    pub fn new_delta(type_index: u8, fields: Vec<Field>) -> Self {
        Self {
            type_index,
            delta: true,
            fields,
        }
    }

    /// Record type code.
    pub fn type_index(&self) -> u8 {
        self.type_index
    }

    /// Returns `true` for delta records.
    pub fn is_delta(&self) -> bool {
        self.delta
    }

    /// Field values.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field value at `index`.
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Timestamp (field 0), in the time series' unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordSet`] if field 0 is not a timestamp.
    pub fn timestamp(&self) -> Result<i64> {
        match self.fields.first() {
            Some(Field::Timestamp(timestamp)) => Ok(*timestamp),
            _ => Err(Error::invalid_record_set(
                "record does not start with a timestamp field",
            )),
        }
    }

    /// Applies `delta` to this record, returning an absolute record.
    pub fn add(&self, delta: &Record) -> Result<Record> {
        self.check_compatible(delta)?;
        let fields = self
            .fields
            .iter()
            .zip(&delta.fields)
            .map(|(value, delta)| value.add(delta))
            .collect::<Result<Vec<_>>>()?;
        Ok(Record::new(self.type_index, fields))
    }

    /// Returns the delta record `self - previous`.
    pub fn subtract(&self, previous: &Record) -> Result<Record> {
        self.check_compatible(previous)?;
        let fields = self
            .fields
            .iter()
            .zip(&previous.fields)
            .map(|(value, previous)| value.subtract(previous))
            .collect::<Result<Vec<_>>>()?;
        Ok(Record::new_delta(self.type_index, fields))
    }

    fn check_compatible(&self, other: &Record) -> Result<()> {
        if self.type_index != other.type_index || self.fields.len() != other.fields.len() {
            return Err(Error::invalid_record_set(format!(
                "records of type {} and {} cannot be combined",
                self.type_index, other.type_index
            )));
        }
        Ok(())
    }

    /// Checks the record against its record type definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecordSet`] on an unknown type code or a field
    /// count or type mismatch.
    pub fn validate(&self, definition: &TimeSeriesDefinition) -> Result<()> {
        let record_type = definition.record_type(self.type_index as usize)?;
        if record_type.fields().len() != self.fields.len() {
            return Err(Error::invalid_record_set(format!(
                "record type {} expects {} fields, got {}",
                record_type.name(),
                record_type.fields().len(),
                self.fields.len()
            )));
        }
        for (field, expected) in self.fields.iter().zip(record_type.fields()) {
            if field.field_type() != expected.field_type {
                return Err(Error::invalid_record_set(format!(
                    "field {} of {} expects {:?}, got {:?}",
                    expected.name,
                    record_type.name(),
                    expected.field_type,
                    field.field_type()
                )));
            }
        }
        Ok(())
    }

    fn bitmap(&self) -> u64 {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_default())
            .fold(0u64, |bits, (index, _)| bits | (1 << index))
    }

    fn payload_size(&self) -> usize {
        varint::compute_u64_size(self.bitmap())
            + self
                .fields
                .iter()
                .filter(|f| !f.is_default())
                .map(Field::compute_size)
                .sum::<usize>()
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn compute_size(&self) -> usize {
        let payload = self.payload_size();
        1 + varint::compute_u64_size(payload as u64) + payload
    }

    /// Serializes the record.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        let type_byte = if self.delta {
            self.type_index | DELTA_FLAG
        } else {
            self.type_index
        };
        writer.write_u8(type_byte)?;
        writer.write_var_usize(self.payload_size())?;
        writer.write_var_u64(self.bitmap())?;
        for field in self.fields.iter().filter(|f| !f.is_default()) {
            field.write_value(writer)?;
        }
        Ok(())
    }

    /// Deserializes a record of `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] when the bytes do not match the
    /// definition.
    pub fn read_from(reader: &mut dyn ByteReader, definition: &TimeSeriesDefinition) -> Result<Self> {
        let type_byte = reader.read_u8()?;
        let type_index = type_byte & !DELTA_FLAG;
        let delta = type_byte & DELTA_FLAG != 0;
        let record_type = definition
            .record_types()
            .get(type_index as usize)
            .ok_or_else(|| Error::corrupted(format!("unknown record type {type_index}")))?;

        let length = reader.read_var_usize()?;
        let mut payload = ReadBuffer::new(reader.slice(length)?);
        let bitmap = payload.read_var_u64()?;
        let count = record_type.fields().len();
        if count < 64 && bitmap >> count != 0 {
            return Err(Error::corrupted(format!(
                "field bitmap {bitmap:#x} exceeds {count} fields"
            )));
        }

        let mut fields = Vec::with_capacity(count);
        for (index, definition) in record_type.fields().iter().enumerate() {
            if bitmap & (1 << index) != 0 {
                fields.push(definition.field_type.read_value(&mut payload)?);
            } else {
                fields.push(definition.field_type.default_value());
            }
        }
        if payload.is_readable() {
            return Err(Error::corrupted(format!(
                "{} trailing bytes in record payload",
                payload.remaining()
            )));
        }
        Ok(Self {
            type_index,
            delta,
            fields,
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}[", if self.delta { "Δ" } else { "" }, self.type_index)?;
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}")?;
        }
        write!(f, "]")
    }
}
