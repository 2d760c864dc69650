//! Persistent chunk lists and a reader spanning several chunks.

use super::{ByteReader, Endian};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct Link {
    chunk: Bytes,
    previous: Option<Arc<Link>>,
}

/// Immutable sequence of byte chunks.
///
/// [`CompositeBuffer::append`] returns a new buffer sharing every existing
/// chunk with the original one, which stays valid and unchanged.
#[derive(Debug, Clone, Default)]
pub struct CompositeBuffer {
    last: Option<Arc<Link>>,
    len: usize,
    chunk_count: usize,
}

impl CompositeBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a buffer holding the chunks of `self` followed by `chunk`.
    pub fn append(&self, chunk: Bytes) -> Self {
        if chunk.is_empty() {
            return self.clone();
        }
        let len = self.len + chunk.len();
        Self {
            last: Some(Arc::new(Link {
                chunk,
                previous: self.last.clone(),
            })),
            len,
            chunk_count: self.chunk_count + 1,
        }
    }

    /// Total number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Chunks in append order.
    pub fn chunks(&self) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity(self.chunk_count);
        let mut link = self.last.as_deref();
        while let Some(current) = link {
            chunks.push(current.chunk.clone());
            link = current.previous.as_deref();
        }
        chunks.reverse();
        chunks
    }

    /// Reader over the whole content.
    pub fn reader(&self) -> ChunkedReader {
        ChunkedReader::new(self.chunks())
    }
}

/// Reader over a sequence of chunks as if they were contiguous.
///
/// Slices that fall inside a single chunk are zero-copy; slices spanning a
/// chunk boundary are copied.
#[derive(Debug, Default)]
pub struct ChunkedReader {
    chunks: VecDeque<Bytes>,
    remaining: usize,
    endian: Endian,
}

impl ChunkedReader {
    /// Creates a big-endian reader over `chunks`.
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        let chunks: VecDeque<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        let remaining = chunks.iter().map(Bytes::len).sum();
        Self {
            chunks,
            remaining,
            endian: Endian::Big,
        }
    }

    /// Appends more chunks after the existing ones.
    pub fn extend(&mut self, chunks: impl IntoIterator<Item = Bytes>) {
        for chunk in chunks {
            if !chunk.is_empty() {
                self.remaining += chunk.len();
                self.chunks.push_back(chunk);
            }
        }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if needed > self.remaining {
            return Err(Error::UnexpectedEndOfData {
                needed,
                remaining: self.remaining,
            });
        }
        Ok(())
    }

    fn take_front(&mut self, length: usize) -> Bytes {
        let front = &mut self.chunks[0];
        let taken = front.split_to(length);
        if front.is_empty() {
            self.chunks.pop_front();
        }
        self.remaining -= length;
        taken
    }
}

impl ByteReader for ChunkedReader {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure(dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            let available = self.chunks[0].len().min(dst.len() - filled);
            let part = self.take_front(available);
            dst[filled..filled + available].copy_from_slice(&part);
            filled += available;
        }
        Ok(())
    }

    fn slice(&mut self, length: usize) -> Result<Bytes> {
        self.ensure(length)?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        if self.chunks[0].len() >= length {
            return Ok(self.take_front(length));
        }
        let mut joined = BytesMut::with_capacity(length);
        while joined.len() < length {
            let available = self.chunks[0].len().min(length - joined.len());
            joined.extend_from_slice(&self.take_front(available));
        }
        Ok(joined.freeze())
    }
}
