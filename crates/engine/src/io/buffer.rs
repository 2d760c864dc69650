//! In-memory [`ByteReader`]/[`ByteWriter`] implementations.

use super::{ByteReader, ByteWriter, Endian};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Reader over an immutable, reference-counted byte buffer.
///
/// [`ByteReader::slice`] hands out views sharing the underlying allocation.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    data: Bytes,
    position: usize,
    endian: Endian,
}

impl ReadBuffer {
    /// Creates a big-endian reader positioned at the start of `data`.
    pub fn new(data: Bytes) -> Self {
        Self::with_endian(data, Endian::Big)
    }

    /// Creates a reader with an explicit byte order.
    pub fn with_endian(data: Bytes, endian: Endian) -> Self {
        Self {
            data,
            position: 0,
            endian,
        }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the read offset.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(Error::UnexpectedEndOfData {
                needed: position,
                remaining: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Total length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(Error::UnexpectedEndOfData { needed, remaining });
        }
        Ok(())
    }
}

impl ByteReader for ReadBuffer {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure(dst.len())?;
        dst.copy_from_slice(&self.data[self.position..self.position + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    fn slice(&mut self, length: usize) -> Result<Bytes> {
        self.ensure(length)?;
        let view = self.data.slice(self.position..self.position + length);
        self.position += length;
        Ok(view)
    }
}

/// Growable writer backed by a [`BytesMut`].
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: BytesMut,
    endian: Endian,
}

impl WriteBuffer {
    /// Creates an empty big-endian buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            endian: Endian::Big,
        }
    }

    /// Creates an empty buffer with an explicit byte order.
    pub fn with_endian(endian: Endian) -> Self {
        Self {
            data: BytesMut::new(),
            endian,
        }
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Converts the written bytes into an immutable buffer.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

impl ByteWriter for WriteBuffer {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn position(&self) -> u64 {
        self.data.len() as u64
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        self.data.put_slice(src);
        Ok(())
    }
}
