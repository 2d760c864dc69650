//! Binary primitive I/O.
//!
//! [`ByteReader`] and [`ByteWriter`] are the byte-level contracts every
//! persisted structure is written against: endian-configurable fixed-width
//! integers, LEB128/zig-zag varints, booleans as a single byte and zero-copy
//! slices. Both traits are object safe so that codecs can work over
//! `&mut dyn ByteReader` regardless of the backing storage.

pub mod buffer;
pub mod checksum;
pub mod composite;
pub mod slab;
pub mod varint;

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use checksum::{checksum, ChecksumReader, ChecksumWriter, CHECKSUM_SIZE};
pub use composite::{ChunkedReader, CompositeBuffer};
pub use slab::{SlabAllocator, SlabStats};

/// Byte order used for fixed-width integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Most significant byte first. Used for every on-disk structure.
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

macro_rules! read_fixed {
    ($name:ident, $ty:ty, $size:expr, $read:ident) => {
        /// Reads a fixed-width integer in this reader's byte order.
        fn $name(&mut self) -> Result<$ty> {
            let mut buf = [0u8; $size];
            self.read_exact(&mut buf)?;
            Ok(match self.endian() {
                Endian::Big => BigEndian::$read(&buf),
                Endian::Little => LittleEndian::$read(&buf),
            })
        }
    };
}

macro_rules! write_fixed {
    ($name:ident, $ty:ty, $size:expr, $write:ident) => {
        /// Writes a fixed-width integer in this writer's byte order.
        fn $name(&mut self, value: $ty) -> Result<()> {
            let mut buf = [0u8; $size];
            match self.endian() {
                Endian::Big => BigEndian::$write(&mut buf, value),
                Endian::Little => LittleEndian::$write(&mut buf, value),
            }
            self.write_all(&buf)
        }
    };
}

/// Sequential reader over a byte source.
pub trait ByteReader {
    /// Byte order of fixed-width reads.
    fn endian(&self) -> Endian;

    /// Number of bytes that can still be read.
    fn remaining(&self) -> usize;

    /// Fills `dst` entirely or fails with [`Error::UnexpectedEndOfData`].
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Returns the next `length` bytes without copying when the source allows it.
    fn slice(&mut self, length: usize) -> Result<Bytes>;

    /// Advances past `length` bytes.
    fn skip(&mut self, length: usize) -> Result<()> {
        self.slice(length).map(|_| ())
    }

    /// Returns `true` while at least one byte remains.
    fn is_readable(&self) -> bool {
        self.remaining() > 0
    }

    /// Reads one byte.
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads one signed byte.
    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads a boolean stored as one byte.
    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::corrupted(format!("invalid boolean byte {other}"))),
        }
    }

    read_fixed!(read_u16, u16, 2, read_u16);
    read_fixed!(read_i16, i16, 2, read_i16);
    read_fixed!(read_u32, u32, 4, read_u32);
    read_fixed!(read_i32, i32, 4, read_i32);
    read_fixed!(read_u64, u64, 8, read_u64);
    read_fixed!(read_i64, i64, 8, read_i64);

    /// Reads an unsigned LEB128 varint.
    fn read_var_u64(&mut self) -> Result<u64> {
        let mut result = 0u64;
        for index in 0..varint::MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7f) as u64;
            if index == varint::MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(Error::corrupted("varint overflows 64 bits"));
            }
            result |= bits << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::corrupted("varint longer than 10 bytes"))
    }

    /// Reads a zig-zag encoded signed varint.
    fn read_var_i64(&mut self) -> Result<i64> {
        Ok(varint::zigzag_decode(self.read_var_u64()?))
    }

    /// Reads a zig-zag encoded signed varint that must fit in 32 bits.
    fn read_var_i32(&mut self) -> Result<i32> {
        let value = self.read_var_i64()?;
        i32::try_from(value).map_err(|_| Error::corrupted(format!("varint {value} overflows i32")))
    }

    /// Reads an unsigned varint used as a length or count.
    fn read_var_usize(&mut self) -> Result<usize> {
        let value = self.read_var_u64()?;
        usize::try_from(value)
            .map_err(|_| Error::corrupted(format!("length {value} does not fit in memory")))
    }

    /// Reads a varint-length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let length = self.read_var_usize()?;
        let bytes = self.slice(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::corrupted(format!("invalid UTF-8 string: {err}")))
    }
}

/// Sequential writer into a byte sink.
pub trait ByteWriter {
    /// Byte order of fixed-width writes.
    fn endian(&self) -> Endian;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Writes all of `src`.
    fn write_all(&mut self, src: &[u8]) -> Result<()>;

    /// Writes one byte.
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    /// Writes one signed byte.
    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Writes a boolean as one byte.
    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    write_fixed!(write_u16, u16, 2, write_u16);
    write_fixed!(write_i16, i16, 2, write_i16);
    write_fixed!(write_u32, u32, 4, write_u32);
    write_fixed!(write_i32, i32, 4, write_i32);
    write_fixed!(write_u64, u64, 8, write_u64);
    write_fixed!(write_i64, i64, 8, write_i64);

    /// Writes an unsigned LEB128 varint.
    fn write_var_u64(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; varint::MAX_VARINT_LEN];
        let len = varint::encode_u64(value, &mut buf);
        self.write_all(&buf[..len])
    }

    /// Writes a zig-zag encoded signed varint.
    fn write_var_i64(&mut self, value: i64) -> Result<()> {
        self.write_var_u64(varint::zigzag_encode(value))
    }

    /// Writes a zig-zag encoded 32-bit signed varint.
    fn write_var_i32(&mut self, value: i32) -> Result<()> {
        self.write_var_i64(value as i64)
    }

    /// Writes a length or count as an unsigned varint.
    fn write_var_usize(&mut self, value: usize) -> Result<()> {
        self.write_var_u64(value as u64)
    }

    /// Writes a varint-length-prefixed UTF-8 string.
    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_var_usize(value.len())?;
        self.write_all(value.as_bytes())
    }
}

impl<R: ByteReader + ?Sized> ByteReader for &mut R {
    fn endian(&self) -> Endian {
        (**self).endian()
    }

    fn remaining(&self) -> usize {
        (**self).remaining()
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        (**self).read_exact(dst)
    }

    fn slice(&mut self, length: usize) -> Result<Bytes> {
        (**self).slice(length)
    }
}

impl<W: ByteWriter + ?Sized> ByteWriter for &mut W {
    fn endian(&self) -> Endian {
        (**self).endian()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        (**self).write_all(src)
    }
}

/// Number of bytes [`ByteWriter::write_string`] produces for `value`.
pub fn compute_string_size(value: &str) -> usize {
    varint::compute_u64_size(value.len() as u64) + value.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_endianness() {
        let mut big = WriteBuffer::new();
        big.write_u32(0x0102_0304).unwrap();
        assert_eq!(big.as_slice(), &[1, 2, 3, 4]);

        let mut little = WriteBuffer::with_endian(Endian::Little);
        little.write_u32(0x0102_0304).unwrap();
        assert_eq!(little.as_slice(), &[4, 3, 2, 1]);

        let mut reader = ReadBuffer::with_endian(little.freeze(), Endian::Little);
        assert_eq!(reader.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_mixed_primitives() {
        let mut writer = WriteBuffer::new();
        writer.write_bool(true).unwrap();
        writer.write_i8(-3).unwrap();
        writer.write_i64(-42).unwrap();
        writer.write_var_i64(-1_000_000).unwrap();
        writer.write_var_u64(u64::MAX).unwrap();
        writer.write_string("cpu.load").unwrap();
        writer.write_u16(65535).unwrap();

        let mut reader = ReadBuffer::new(writer.freeze());
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i8().unwrap(), -3);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_var_i64().unwrap(), -1_000_000);
        assert_eq!(reader.read_var_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_string().unwrap(), "cpu.load");
        assert_eq!(reader.read_u16().unwrap(), 65535);
        assert!(!reader.is_readable());
    }

    #[test]
    fn test_invalid_bool_is_corruption() {
        let mut reader = ReadBuffer::new(Bytes::from_static(&[7]));
        assert!(matches!(reader.read_bool(), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_truncated_varint() {
        let mut reader = ReadBuffer::new(Bytes::from_static(&[0x80, 0x80]));
        assert!(matches!(
            reader.read_var_u64(),
            Err(Error::UnexpectedEndOfData { .. })
        ));
    }

    #[test]
    fn test_string_size() {
        assert_eq!(compute_string_size("abc"), 4);
        assert_eq!(compute_string_size(&"x".repeat(200)), 202);
    }
}
