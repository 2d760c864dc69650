//! Pre-allocated, memory-mapped commit log segments.
//!
//! # Entry Format
//!
//! ```text
//! +-------------+----------------------+---------+-------------------+
//! | length (4B) | crc(id, length) (8B) | payload | crc(payload) (8B) |
//! +-------------+----------------------+---------+-------------------+
//! ```
//!
//! The header checksum covers the segment id, so entries left in a recycled
//! file by its previous id never pass as entries of the new one.
//!
//! The four bytes after the last entry always hold [`END_OF_SEGMENT_MARKER`]
//! unless the segment is full.

use super::position::ReplayPosition;
use crate::error::{Error, Result};
use crate::io::{checksum, CHECKSUM_SIZE};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Segment file name prefix.
pub const SEGMENT_PREFIX: &str = "CommitLog-";

/// Segment file extension.
pub const SEGMENT_EXTENSION: &str = "log";

/// Size of the length prefix.
const LENGTH_SIZE: usize = 4;

/// Bytes added to every payload: length and both checksums.
pub const LOG_OVERHEAD_SIZE: usize = LENGTH_SIZE + 2 * CHECKSUM_SIZE;

/// Length value that marks the end of the written entries.
pub const END_OF_SEGMENT_MARKER: u32 = 0;

/// Outcome of replaying one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentReplay {
    /// Entries handed to the callback.
    pub entries: usize,
    /// Entries skipped because they were at or before the start position.
    pub skipped: usize,
    /// `true` if replay stopped on a corrupt or partial entry instead of the
    /// end marker or the end of the file.
    pub truncated: bool,
}

/// One commit log file.
pub struct CommitLogSegment {
    id: u64,
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    position: usize,
    synced: usize,
}

impl CommitLogSegment {
    /// Path of segment `id` in `dir`.
    pub fn path_for(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{SEGMENT_PREFIX}{id}.{SEGMENT_EXTENSION}"))
    }

    /// Parses the segment id from a segment file path.
    pub fn parse_id(path: &Path) -> Option<u64> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        path.file_stem()?
            .to_str()?
            .strip_prefix(SEGMENT_PREFIX)?
            .parse()
            .ok()
    }

    /// Creates a zero-filled segment of `size` bytes.
    pub fn fresh(dir: &Path, id: u64, size: usize) -> Result<Self> {
        let path = Self::path_for(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!("Created commit log segment {}", path.display());
        Ok(Self {
            id,
            path,
            file,
            mmap,
            position: 0,
            synced: 0,
        })
    }

    /// Opens an existing segment, positioned at its start.
    pub fn open(path: &Path) -> Result<Self> {
        let id = Self::parse_id(path).ok_or_else(|| {
            Error::corrupted(format!("not a commit log segment: {}", path.display()))
        })?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::corrupted(format!(
                "empty commit log segment: {}",
                path.display()
            )));
        }
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            mmap,
            position: 0,
            synced: 0,
        })
    }

    /// Renames this drained segment to id `new_id` and resets it for writing.
    ///
    /// The old entries stay in the file but are hidden behind the end marker
    /// written at offset 0.
    pub fn recycle(mut self, dir: &Path, new_id: u64) -> Result<Self> {
        let new_path = Self::path_for(dir, new_id);
        fs::rename(&self.path, &new_path)?;
        debug!(
            "Recycled commit log segment {} as {}",
            self.path.display(),
            new_path.display()
        );
        self.id = new_id;
        self.path = new_path;
        self.position = 0;
        self.synced = 0;
        self.write_end_marker();
        self.mmap.flush_range(0, LENGTH_SIZE.min(self.mmap.len()))?;
        Ok(self)
    }

    /// Segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size of the segment.
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    /// Offset of the next write.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Position of the next write as a replay position.
    pub fn replay_position(&self) -> ReplayPosition {
        ReplayPosition::new(self.id, self.position as u64)
    }

    /// Returns `true` if no entry was written yet.
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Returns `true` if a payload of `size` bytes fits in the space left.
    pub fn has_capacity_for(&self, size: usize) -> bool {
        size + LOG_OVERHEAD_SIZE <= self.capacity() - self.position
    }

    /// Appends an entry and returns the position just past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the entry does not fit; callers check
    /// [`has_capacity_for`](Self::has_capacity_for) first.
    pub fn write(&mut self, payload: &[u8]) -> Result<ReplayPosition> {
        if payload.is_empty() {
            return Err(Error::Internal("empty commit log entry".to_string()));
        }
        if !self.has_capacity_for(payload.len()) {
            return Err(Error::Internal(format!(
                "entry of {} bytes does not fit in segment {}",
                payload.len(),
                self.id
            )));
        }
        let start = self.position;
        let buf = &mut self.mmap[start..start + payload.len() + LOG_OVERHEAD_SIZE];
        BigEndian::write_u32(&mut buf[..LENGTH_SIZE], payload.len() as u32);
        let header_crc = header_checksum(self.id, &buf[..LENGTH_SIZE]);
        BigEndian::write_u64(&mut buf[LENGTH_SIZE..LENGTH_SIZE + CHECKSUM_SIZE], header_crc);
        let body = LENGTH_SIZE + CHECKSUM_SIZE;
        buf[body..body + payload.len()].copy_from_slice(payload);
        BigEndian::write_u64(&mut buf[body + payload.len()..], checksum(payload));

        self.position += payload.len() + LOG_OVERHEAD_SIZE;
        self.write_end_marker();
        Ok(self.replay_position())
    }

    fn write_end_marker(&mut self) {
        let position = self.position;
        if let Some(marker) = self.mmap.get_mut(position..position + LENGTH_SIZE) {
            BigEndian::write_u32(marker, END_OF_SEGMENT_MARKER);
        }
    }

    /// Flushes the entries written since the last sync to disk.
    pub fn sync(&mut self) -> Result<()> {
        let end = (self.position + LENGTH_SIZE).min(self.capacity());
        if end > self.synced {
            self.mmap.flush_range(self.synced, end - self.synced)?;
            self.synced = self.position;
        }
        Ok(())
    }

    /// Flushes the whole mapping and the file metadata.
    pub fn sync_all(&mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.synced = self.position;
        Ok(())
    }

    /// Reads every well-formed entry in order and hands entries positioned
    /// after `start` to `callback`.
    ///
    /// Replay stops at the end marker, at the end of the file, or at the first
    /// partial or corrupt entry; the latter is logged and reported through
    /// [`SegmentReplay::truncated`], never as an error. The segment is left
    /// positioned after the last well-formed entry.
    pub fn replay<F>(&mut self, start: ReplayPosition, mut callback: F) -> Result<SegmentReplay>
    where
        F: FnMut(ReplayPosition, Bytes) -> Result<()>,
    {
        let mut outcome = SegmentReplay::default();
        let mut offset = 0usize;
        let data = &self.mmap[..];
        while data.len() - offset >= LENGTH_SIZE {
            let length = BigEndian::read_u32(&data[offset..offset + LENGTH_SIZE]);
            if length == END_OF_SEGMENT_MARKER {
                break;
            }
            let length = length as usize;
            let end = offset + LENGTH_SIZE + CHECKSUM_SIZE + length + CHECKSUM_SIZE;
            if end > data.len() {
                warn!(
                    "Partial entry at offset {} in commit log segment {}, truncating replay",
                    offset, self.id
                );
                outcome.truncated = true;
                break;
            }
            let header = &data[offset..offset + LENGTH_SIZE];
            let stored_header =
                BigEndian::read_u64(&data[offset + LENGTH_SIZE..offset + LENGTH_SIZE + CHECKSUM_SIZE]);
            let body = offset + LENGTH_SIZE + CHECKSUM_SIZE;
            let payload = &data[body..body + length];
            let stored_trailer = BigEndian::read_u64(&data[body + length..end]);
            if stored_header != header_checksum(self.id, header) || stored_trailer != checksum(payload) {
                warn!(
                    "Checksum mismatch at offset {} in commit log segment {}, truncating replay",
                    offset, self.id
                );
                outcome.truncated = true;
                break;
            }

            let position = ReplayPosition::new(self.id, end as u64);
            if position > start {
                callback(position, Bytes::copy_from_slice(payload))?;
                outcome.entries += 1;
            } else {
                outcome.skipped += 1;
            }
            offset = end;
        }
        self.position = offset;
        self.synced = offset;
        debug!(
            "Replayed {} entries from commit log segment {}",
            outcome.entries, self.id
        );
        Ok(outcome)
    }

    /// Deletes the segment file.
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path)?;
        debug!("Removed commit log segment {}", path.display());
        Ok(())
    }
}

fn header_checksum(id: u64, length: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&id.to_be_bytes());
    hasher.update(length);
    u64::from(hasher.finalize())
}

impl std::fmt::Debug for CommitLogSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLogSegment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("position", &self.position)
            .field("capacity", &self.capacity())
            .finish()
    }
}
