//! Block-organized files.
//!
//! A block-organized file is a sequence of fixed-size blocks, each starting
//! with a one-byte tag ([`DATA_BLOCK_PREFIX`] or [`HEADER_BLOCK_PREFIX`]).
//! The tag bytes are invisible to the *logical* stream: logical offsets count
//! only payload bytes.
//!
//! ```text
//! block 0               block 1               block 2
//! +---+---------------+ +---+---------------+ +---+-------------+----+
//! | 0 | node records  | | 0 | node records  | | 1 | header rec. | 00 |
//! +---+---------------+ +---+---------------+ +---+-------------+----+
//! ```
//!
//! Writing a header switches to a fresh HEADER block and zero-fills it after
//! the header record, so a header is always alone in its block. The current
//! header is the last completed HEADER block whose record validates, found by
//! scanning backward.

use crate::error::{Error, Result};
use crate::io::{
    varint, ByteReader, ByteWriter, ChecksumReader, ChecksumWriter, Endian, ReadBuffer,
    CHECKSUM_SIZE,
};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Tag of a block holding node and value records.
pub const DATA_BLOCK_PREFIX: u8 = 0;

/// Tag of a block holding a header record.
pub const HEADER_BLOCK_PREFIX: u8 = 1;

/// Default block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest block size able to hold a header record.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Header record format version.
pub const HEADER_VERSION: u8 = 1;

/// Compression marker for uncompressed payloads.
pub const NO_COMPRESSION: u8 = 0;

/// Kind of a block, as given by its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Node and value records.
    Data,
    /// A header record.
    Header,
}

impl BlockType {
    /// Tag byte of this block type.
    pub fn prefix(self) -> u8 {
        match self {
            BlockType::Data => DATA_BLOCK_PREFIX,
            BlockType::Header => HEADER_BLOCK_PREFIX,
        }
    }

    /// Parses a tag byte.
    pub fn from_prefix(prefix: u8) -> Result<Self> {
        match prefix {
            DATA_BLOCK_PREFIX => Ok(BlockType::Data),
            HEADER_BLOCK_PREFIX => Ok(BlockType::Header),
            other => Err(Error::corrupted(format!("unknown block prefix {other}"))),
        }
    }

    fn flip(self) -> Self {
        match self {
            BlockType::Data => BlockType::Header,
            BlockType::Header => BlockType::Data,
        }
    }
}

/// Location of a length-prefixed, checksummed record in the logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordPointer {
    /// Logical offset of the record's length prefix.
    pub position: u64,
    /// Length of the record payload.
    pub length: u64,
}

impl RecordPointer {
    /// Number of logical bytes the whole record occupies.
    pub fn framed_size(&self) -> u64 {
        (varint::compute_u64_size(self.length) + CHECKSUM_SIZE) as u64 + self.length
    }
}

/// Converts a physical file offset into a logical offset.
pub fn to_logical(physical: u64, block_size: u64) -> u64 {
    physical - physical.div_ceil(block_size)
}

/// Converts a logical offset into the physical offset of the same byte.
pub fn to_physical(logical: u64, block_size: u64) -> u64 {
    logical + logical / (block_size - 1) + 1
}

fn check_block_size(block_size: usize) -> Result<u64> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(Error::InvalidConfig(format!(
            "block size {block_size} is smaller than {MIN_BLOCK_SIZE}"
        )));
    }
    Ok(block_size as u64)
}

/// Appending writer over a block-organized file.
///
/// [`ByteWriter::position`] reports the logical position.
pub struct BlockFileOutput {
    path: PathBuf,
    writer: BufWriter<File>,
    block_size: u64,
    physical: u64,
    block_type: BlockType,
}

impl BlockFileOutput {
    /// Opens `path` for appending, creating it if needed.
    ///
    /// A trailing partial block is the remnant of an interrupted write and is
    /// truncated away, so new writes always start on a block boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or truncated.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let block_size = check_block_size(block_size)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let aligned = len - len % block_size;
        if aligned != len {
            warn!(
                "Truncating {} trailing bytes of partial block in {}",
                len - aligned,
                path.display()
            );
            file.set_len(aligned)?;
        }
        file.seek(SeekFrom::Start(aligned))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            block_size,
            physical: aligned,
            block_type: BlockType::Data,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Type of the block currently written.
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    /// Physical size written so far.
    pub fn physical_position(&self) -> u64 {
        self.physical
    }

    /// Zero-fills the rest of the current block and flips the type used for
    /// the next block.
    pub fn switch_block_type(&mut self) -> Result<()> {
        let offset = self.physical % self.block_size;
        if offset != 0 {
            let padding = vec![0u8; (self.block_size - offset) as usize];
            self.writer.write_all(&padding)?;
            self.physical += padding.len() as u64;
        }
        self.block_type = self.block_type.flip();
        Ok(())
    }

    /// Appends `payload` as `[varint length][payload][checksum]`.
    pub fn write_record(&mut self, payload: &[u8]) -> Result<RecordPointer> {
        let position = self.position();
        write_framed(self, payload)?;
        Ok(RecordPointer {
            position,
            length: payload.len() as u64,
        })
    }

    /// Writes a header record in its own HEADER block, then returns to DATA
    /// blocks and makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the header does not fit in one block.
    pub fn write_header(&mut self, payload: &[u8]) -> Result<()> {
        let size = 3 + varint::compute_u64_size(payload.len() as u64) + payload.len() + CHECKSUM_SIZE;
        if size as u64 > self.block_size {
            return Err(Error::Internal(format!(
                "header of {} bytes does not fit in a {} byte block",
                payload.len(),
                self.block_size
            )));
        }

        if self.block_type == BlockType::Data {
            self.switch_block_type()?;
        }
        self.write_u8(HEADER_VERSION)?;
        self.write_u8(NO_COMPRESSION)?;
        write_framed(self, payload)?;
        self.switch_block_type()?;
        self.sync()?;

        debug!(
            "Wrote header block at physical offset {} in {}",
            self.physical - self.block_size,
            self.path.display()
        );
        Ok(())
    }

    /// Flushes buffered bytes to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the file data.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl ByteWriter for BlockFileOutput {
    fn endian(&self) -> Endian {
        Endian::Big
    }

    fn position(&self) -> u64 {
        to_logical(self.physical, self.block_size)
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        let mut remaining = src;
        while !remaining.is_empty() {
            let offset = self.physical % self.block_size;
            if offset == 0 {
                self.writer.write_all(&[self.block_type.prefix()])?;
                self.physical += 1;
                continue;
            }
            let space = (self.block_size - offset) as usize;
            let n = space.min(remaining.len());
            self.writer.write_all(&remaining[..n])?;
            self.physical += n as u64;
            remaining = &remaining[n..];
        }
        Ok(())
    }
}

fn write_framed<W: ByteWriter + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let mut writer = ChecksumWriter::new(writer);
    writer.write_var_usize(payload.len())?;
    writer.reset_checksum();
    writer.write_all(payload)?;
    writer.write_checksum()
}

fn read_framed<R: ByteReader>(reader: R) -> Result<Bytes> {
    let mut reader = ChecksumReader::new(reader);
    let length = reader.read_var_usize()?;
    reader.reset_checksum();
    let payload = reader.slice(length)?;
    reader.read_checksum()?;
    Ok(payload)
}

/// Random-access reader over a block-organized file.
pub struct BlockFileInput {
    path: PathBuf,
    file: File,
    block_size: u64,
    header_cursor: u64,
    header_block: Option<u64>,
}

impl BlockFileInput {
    /// Opens `path` for reading.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let block_size = check_block_size(block_size)?;
        let file = File::open(&path)?;
        let mut input = Self {
            path,
            file,
            block_size,
            header_cursor: 0,
            header_block: None,
        };
        input.header_cursor = input.completed_blocks()?;
        Ok(input)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical size of the file.
    pub fn physical_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Size of the logical stream.
    pub fn logical_size(&self) -> Result<u64> {
        Ok(to_logical(self.physical_size()?, self.block_size))
    }

    fn completed_blocks(&self) -> Result<u64> {
        Ok(self.physical_size()? / self.block_size)
    }

    /// Reads `length` logical bytes starting at logical offset `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedEndOfData`] if the range extends past the
    /// end of the file.
    pub fn read_logical(&mut self, position: u64, length: usize) -> Result<Bytes> {
        let size = self.logical_size()?;
        if position + length as u64 > size {
            return Err(Error::UnexpectedEndOfData {
                needed: length,
                remaining: size.saturating_sub(position) as usize,
            });
        }

        let mut out = vec![0u8; length];
        let mut filled = 0;
        let mut physical = to_physical(position, self.block_size);
        while filled < length {
            let offset = physical % self.block_size;
            if offset == 0 {
                physical += 1;
                continue;
            }
            let n = ((self.block_size - offset) as usize).min(length - filled);
            self.file.seek(SeekFrom::Start(physical))?;
            self.file.read_exact(&mut out[filled..filled + n])?;
            filled += n;
            physical += n as u64;
        }
        Ok(Bytes::from(out))
    }

    /// Reads the record referenced by `pointer`, validating its checksum.
    pub fn read_record(&mut self, pointer: RecordPointer) -> Result<Bytes> {
        let framed = self.read_logical(pointer.position, pointer.framed_size() as usize)?;
        let payload = read_framed(ReadBuffer::new(framed))?;
        if payload.len() as u64 != pointer.length {
            return Err(Error::corrupted(format!(
                "record at {} has length {}, expected {}",
                pointer.position,
                payload.len(),
                pointer.length
            )));
        }
        Ok(payload)
    }

    /// Moves to the previous HEADER-tagged block among the completed blocks.
    ///
    /// The first call starts from the last completed block. Returns `false`
    /// once no earlier header block exists.
    pub fn seek_header(&mut self) -> Result<bool> {
        while self.header_cursor > 0 {
            self.header_cursor -= 1;
            let mut tag = [0u8; 1];
            self.file
                .seek(SeekFrom::Start(self.header_cursor * self.block_size))?;
            self.file.read_exact(&mut tag)?;
            if tag[0] == HEADER_BLOCK_PREFIX {
                self.header_block = Some(self.header_cursor);
                return Ok(true);
            }
        }
        self.header_block = None;
        Ok(false)
    }

    /// Index of the header block found by the last [`seek_header`](Self::seek_header).
    pub fn header_block(&self) -> Option<u64> {
        self.header_block
    }

    /// Returns the payload of the most recent valid header record.
    ///
    /// Header blocks failing validation are skipped with a warning. `None`
    /// means the file holds no header at all.
    pub fn read_header(&mut self) -> Result<Option<Bytes>> {
        self.header_cursor = self.completed_blocks()?;
        while self.seek_header()? {
            let block = self.header_cursor;
            match self.parse_header_block(block) {
                Ok(payload) => return Ok(Some(payload)),
                Err(err) => warn!(
                    "Skipping invalid header block {} in {}: {}",
                    block,
                    self.path.display(),
                    err
                ),
            }
        }
        Ok(None)
    }

    fn parse_header_block(&mut self, block: u64) -> Result<Bytes> {
        let mut content = vec![0u8; (self.block_size - 1) as usize];
        self.file.seek(SeekFrom::Start(block * self.block_size + 1))?;
        self.file.read_exact(&mut content)?;

        let mut reader = ReadBuffer::new(Bytes::from(content));
        let version = reader.read_u8()?;
        if version != HEADER_VERSION {
            return Err(Error::corrupted(format!("unsupported header version {version}")));
        }
        let compression = reader.read_u8()?;
        if compression != NO_COMPRESSION {
            return Err(Error::corrupted(format!("unsupported compression {compression}")));
        }
        read_framed(reader)
    }
}
