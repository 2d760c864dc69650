//! Typed record fields.

use super::decimal::Decimal;
use crate::error::{Error, Result};
use crate::io::{varint, ByteReader, ByteWriter};
use std::fmt;

/// Type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Signed 8-bit integer.
    Byte,
    /// Signed 32-bit integer.
    Integer,
    /// Signed 64-bit integer.
    Long,
    /// Base-10 decimal.
    Decimal,
    /// Timestamp in the unit of its time series.
    Timestamp,
}

impl FieldType {
    /// Serialized code.
    pub fn code(self) -> u8 {
        match self {
            FieldType::Byte => 0,
            FieldType::Integer => 1,
            FieldType::Long => 2,
            FieldType::Decimal => 3,
            FieldType::Timestamp => 4,
        }
    }

    /// Parses a serialized code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(FieldType::Byte),
            1 => Ok(FieldType::Integer),
            2 => Ok(FieldType::Long),
            3 => Ok(FieldType::Decimal),
            4 => Ok(FieldType::Timestamp),
            other => Err(Error::corrupted(format!("unknown field type code {other}"))),
        }
    }

    /// Default value of the type. Default fields are not serialized.
    pub fn default_value(self) -> Field {
        match self {
            FieldType::Byte => Field::Byte(0),
            FieldType::Integer => Field::Integer(0),
            FieldType::Long => Field::Long(0),
            FieldType::Decimal => Field::Decimal(Decimal::ZERO),
            FieldType::Timestamp => Field::Timestamp(0),
        }
    }

    /// Reads a value of this type.
    pub fn read_value(self, reader: &mut dyn ByteReader) -> Result<Field> {
        Ok(match self {
            FieldType::Byte => Field::Byte(reader.read_i8()?),
            FieldType::Integer => Field::Integer(reader.read_var_i32()?),
            FieldType::Long => Field::Long(reader.read_var_i64()?),
            FieldType::Decimal => {
                let mantissa = reader.read_var_i64()?;
                let exponent = reader.read_i8()?;
                Field::Decimal(Decimal::new(mantissa, exponent))
            }
            FieldType::Timestamp => Field::Timestamp(reader.read_var_i64()?),
        })
    }
}

/// A field value.
///
/// Integer-like fields use wrapping arithmetic, so subtracting then adding
/// always restores the original value. Decimal arithmetic follows
/// [`Decimal`] and may produce NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// BYTE value.
    Byte(i8),
    /// INTEGER value.
    Integer(i32),
    /// LONG value.
    Long(i64),
    /// DECIMAL value.
    Decimal(Decimal),
    /// TIMESTAMP value.
    Timestamp(i64),
}

impl Field {
    /// Type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Byte(_) => FieldType::Byte,
            Field::Integer(_) => FieldType::Integer,
            Field::Long(_) => FieldType::Long,
            Field::Decimal(_) => FieldType::Decimal,
            Field::Timestamp(_) => FieldType::Timestamp,
        }
    }

    /// Returns `true` if this is the default value of its type.
    pub fn is_default(&self) -> bool {
        *self == self.field_type().default_value()
    }

    /// Field-wise sum, used to apply a delta.
    pub fn add(&self, delta: &Field) -> Result<Field> {
        Ok(match (self, delta) {
            (Field::Byte(a), Field::Byte(b)) => Field::Byte(a.wrapping_add(*b)),
            (Field::Integer(a), Field::Integer(b)) => Field::Integer(a.wrapping_add(*b)),
            (Field::Long(a), Field::Long(b)) => Field::Long(a.wrapping_add(*b)),
            (Field::Decimal(a), Field::Decimal(b)) => Field::Decimal(a.add(*b)),
            (Field::Timestamp(a), Field::Timestamp(b)) => Field::Timestamp(a.wrapping_add(*b)),
            _ => return Err(mismatch(self, delta)),
        })
    }

    /// Field-wise difference `self - other`, used to build a delta.
    pub fn subtract(&self, other: &Field) -> Result<Field> {
        Ok(match (self, other) {
            (Field::Byte(a), Field::Byte(b)) => Field::Byte(a.wrapping_sub(*b)),
            (Field::Integer(a), Field::Integer(b)) => Field::Integer(a.wrapping_sub(*b)),
            (Field::Long(a), Field::Long(b)) => Field::Long(a.wrapping_sub(*b)),
            (Field::Decimal(a), Field::Decimal(b)) => Field::Decimal(a.subtract(*b)),
            (Field::Timestamp(a), Field::Timestamp(b)) => Field::Timestamp(a.wrapping_sub(*b)),
            _ => return Err(mismatch(self, other)),
        })
    }

    /// Number of bytes [`write_value`](Self::write_value) produces.
    pub fn compute_size(&self) -> usize {
        match self {
            Field::Byte(_) => 1,
            Field::Integer(v) => varint::compute_i64_size(*v as i64),
            Field::Long(v) | Field::Timestamp(v) => varint::compute_i64_size(*v),
            Field::Decimal(d) => varint::compute_i64_size(d.mantissa()) + 1,
        }
    }

    /// Serializes the value without its type.
    pub fn write_value(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        match self {
            Field::Byte(v) => writer.write_i8(*v),
            Field::Integer(v) => writer.write_var_i32(*v),
            Field::Long(v) | Field::Timestamp(v) => writer.write_var_i64(*v),
            Field::Decimal(d) => {
                writer.write_var_i64(d.mantissa())?;
                writer.write_i8(d.exponent())
            }
        }
    }
}

fn mismatch(left: &Field, right: &Field) -> Error {
    Error::invalid_record_set(format!(
        "field type mismatch: {:?} and {:?}",
        left.field_type(),
        right.field_type()
    ))
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Byte(v) => write!(f, "{v}"),
            Field::Integer(v) => write!(f, "{v}"),
            Field::Long(v) => write!(f, "{v}"),
            Field::Decimal(d) => write!(f, "{d}"),
            Field::Timestamp(v) => write!(f, "@{v}"),
        }
    }
}
