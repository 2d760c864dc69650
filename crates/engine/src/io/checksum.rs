//! Checksum-wrapped readers and writers.
//!
//! The checksum is a CRC-32 (`crc32fast`) stored widened to an 8-byte
//! unsigned integer. Bytes written or read between a `reset_checksum` and the
//! matching `write_checksum`/`read_checksum` are covered; the stored checksum
//! itself is not.

use super::{ByteReader, ByteWriter, Endian};
use crate::error::{Error, Result};
use bytes::Bytes;
use crc32fast::Hasher;

/// Size in bytes of a stored checksum.
pub const CHECKSUM_SIZE: usize = 8;

/// Computes the stored checksum of `data`.
pub fn checksum(data: &[u8]) -> u64 {
    crc32fast::hash(data) as u64
}

/// Writer computing a rolling checksum over everything written through it.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: ByteWriter> ChecksumWriter<W> {
    /// Wraps `inner` with a fresh checksum.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Starts a new checksum from the next byte written.
    pub fn reset_checksum(&mut self) {
        self.hasher = Hasher::new();
    }

    /// Appends the checksum of the bytes written since the last reset.
    pub fn write_checksum(&mut self) -> Result<()> {
        let value = self.hasher.clone().finalize() as u64;
        self.inner.write_u64(value)
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Mutable access to the wrapped writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: ByteWriter> ByteWriter for ChecksumWriter<W> {
    fn endian(&self) -> Endian {
        self.inner.endian()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        self.hasher.update(src);
        self.inner.write_all(src)
    }
}

/// Reader computing a rolling checksum over everything read through it.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Hasher,
}

impl<R: ByteReader> ChecksumReader<R> {
    /// Wraps `inner` with a fresh checksum.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Starts a new checksum from the next byte read.
    pub fn reset_checksum(&mut self) {
        self.hasher = Hasher::new();
    }

    /// Reads the stored checksum and validates it against the bytes read
    /// since the last reset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] when the values differ.
    pub fn read_checksum(&mut self) -> Result<()> {
        let actual = self.hasher.clone().finalize() as u64;
        let expected = self.inner.read_u64()?;
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    /// Returns the wrapped reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ByteReader> ByteReader for ChecksumReader<R> {
    fn endian(&self) -> Endian {
        self.inner.endian()
    }

    fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.inner.read_exact(dst)?;
        self.hasher.update(dst);
        Ok(())
    }

    fn slice(&mut self, length: usize) -> Result<Bytes> {
        let bytes = self.inner.slice(length)?;
        self.hasher.update(&bytes);
        Ok(bytes)
    }
}
