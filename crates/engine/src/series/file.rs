//! Append-only partition data files.
//!
//! # File Format
//!
//! ```text
//! +-------------------------------------------------------------+
//! | varint length | FileMetaData payload | u64 crc of payload   |
//! +-------------------------------------------------------------+
//! | record | record | record | ...   (delta-encoded, appended)  |
//! +-------------------------------------------------------------+
//! ```
//!
//! A new file is written as `<start>.ts.tmp`, synced, then renamed into
//! place so that a partially written header is never observed. Data is only
//! ever appended; the partition metadata remembers the size of the last
//! complete flush and the file is cut back to it on open.

use super::layout::sync_dir;
use crate::error::{Error, Result};
use crate::io::{ByteReader, ByteWriter, ChecksumReader, ChecksumWriter, ReadBuffer, WriteBuffer};
use crate::model::{PartitionId, TimeRange};
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current file format version.
pub const FILE_FORMAT_VERSION: u8 = 1;

/// Upper bound of the header size; bounds the read on open.
const MAX_HEADER_SIZE: u64 = 4096;

/// Header identifying the partition a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    /// Format version.
    pub version: u8,
    /// Database name.
    pub database: String,
    /// Time series name.
    pub series: String,
    /// Partition range.
    pub range: TimeRange,
}

impl FileMetaData {
    /// Creates the header of `partition`'s file.
    pub fn new(partition: &PartitionId) -> Self {
        Self {
            version: FILE_FORMAT_VERSION,
            database: partition.database.clone(),
            series: partition.series.clone(),
            range: partition.range,
        }
    }

    /// Writes the framed header.
    pub fn write_to(&self, writer: &mut dyn ByteWriter) -> Result<()> {
        let mut payload = WriteBuffer::new();
        payload.write_u8(self.version)?;
        payload.write_string(&self.database)?;
        payload.write_string(&self.series)?;
        payload.write_var_i64(self.range.start)?;
        payload.write_var_i64(self.range.end)?;

        writer.write_var_usize(payload.len())?;
        let mut writer = ChecksumWriter::new(writer);
        writer.write_all(payload.as_slice())?;
        writer.write_checksum()
    }

    /// Reads and validates a framed header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] or [`Error::Corrupted`] when the
    /// header is damaged or of an unknown version.
    pub fn read_from(reader: &mut dyn ByteReader) -> Result<Self> {
        let length = reader.read_var_usize()?;
        let mut reader = ChecksumReader::new(reader);
        let mut payload = ReadBuffer::new(reader.slice(length)?);
        reader.read_checksum()?;

        let version = payload.read_u8()?;
        if version != FILE_FORMAT_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported partition file version {version}"
            )));
        }
        let database = payload.read_string()?;
        let series = payload.read_string()?;
        let start = payload.read_var_i64()?;
        let end = payload.read_var_i64()?;
        if payload.is_readable() {
            return Err(Error::corrupted("trailing bytes in partition file header"));
        }
        Ok(Self {
            version,
            database,
            series,
            range: TimeRange::new(start, end),
        })
    }

    /// Returns the framed header bytes.
    pub fn encoded(&self) -> Result<Bytes> {
        let mut buffer = WriteBuffer::new();
        self.write_to(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn matches(&self, partition: &PartitionId) -> bool {
        self.database == partition.database
            && self.series == partition.series
            && self.range == partition.range
    }
}

/// Append-only data file of one partition.
#[derive(Debug)]
pub struct TimeSeriesFile {
    path: PathBuf,
    file: File,
    metadata: FileMetaData,
    header_size: u64,
    size: u64,
}

impl TimeSeriesFile {
    /// Opens the file of `partition` at `path`, creating it if missing.
    ///
    /// `expected_size` is the size recorded by the last complete flush, zero
    /// when nothing was flushed yet; a longer file is cut back to it, a
    /// shorter one is corrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the header belongs to another
    /// partition or the file is shorter than `expected_size`.
    pub fn open(path: impl AsRef<Path>, partition: &PartitionId, expected_size: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            if let Some(size) = expected_size.filter(|&size| size > 0) {
                return Err(Error::corrupted(format!(
                    "partition file {} is missing, expected {size} bytes",
                    path.display()
                )));
            }
            Self::create(path, partition)?;
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (metadata, header_size) = Self::read_header(&mut file)?;
        if !metadata.matches(partition) {
            return Err(Error::corrupted(format!(
                "partition file {} belongs to {}.{}{}, not {}",
                path.display(),
                metadata.database,
                metadata.series,
                metadata.range,
                partition
            )));
        }

        let mut size = file.metadata()?.len();
        if let Some(expected) = expected_size {
            let expected = expected.max(header_size);
            if size < expected {
                return Err(Error::corrupted(format!(
                    "partition file {} has {size} bytes, expected {expected}",
                    path.display()
                )));
            }
            if size > expected {
                warn!(
                    "Truncating {} from {} to {} bytes (incomplete flush)",
                    path.display(),
                    size,
                    expected
                );
                file.set_len(expected)?;
                file.sync_all()?;
                size = expected;
            }
        }
        file.seek(SeekFrom::Start(size))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            metadata,
            header_size,
            size,
        })
    }

    /// Writes a new file holding only the header of `partition`.
    fn create(path: &Path, partition: &PartitionId) -> Result<()> {
        let header = FileMetaData::new(partition).encoded()?;
        let tmp_path = path.with_extension("ts.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&header)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        debug!("Created partition file {}", path.display());
        Ok(())
    }

    fn read_header(file: &mut File) -> Result<(FileMetaData, u64)> {
        let length = file.metadata()?.len().min(MAX_HEADER_SIZE);
        let mut buf = Vec::with_capacity(length as usize);
        file.seek(SeekFrom::Start(0))?;
        Read::by_ref(file).take(length).read_to_end(&mut buf)?;
        let mut reader = ReadBuffer::new(Bytes::from(buf));
        let metadata = FileMetaData::read_from(&mut reader)?;
        Ok((metadata, reader.position() as u64))
    }

    /// Appends `chunks` and syncs the data to disk. Returns the new size.
    ///
    /// On failure the file is cut back to its previous size, so a retried
    /// append never leaves the same records twice.
    pub fn append(&mut self, chunks: &[Bytes]) -> Result<u64> {
        let before = self.size;
        match self.write_chunks(chunks) {
            Ok(appended) => {
                self.size += appended;
                Ok(self.size)
            }
            Err(e) => {
                if let Err(rollback) = self.truncate(before) {
                    warn!(
                        "Failed to roll back partial append to {}: {}",
                        self.path.display(),
                        rollback
                    );
                }
                Err(e)
            }
        }
    }

    fn write_chunks(&mut self, chunks: &[Bytes]) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.size))?;
        let mut appended = 0u64;
        for chunk in chunks {
            self.file.write_all(chunk)?;
            appended += chunk.len() as u64;
        }
        if appended > 0 {
            self.file.sync_data()?;
        }
        Ok(appended)
    }

    /// Cuts the file back to `size` bytes, discarding data appended after it.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let size = size.max(self.header_size);
        // Later appends start at `size` even if the cut below fails; bytes
        // past it are never read and are dropped again on open.
        self.size = size;
        self.file.set_len(size)?;
        self.file.sync_data()?;
        self.file.seek(SeekFrom::Start(size))?;
        Ok(())
    }

    /// Reads the records stored between the header and `end`, a size
    /// previously returned by [`size`](Self::size).
    pub fn read_data(&self, end: u64) -> Result<Bytes> {
        read_data(&self.path, self.header_size, end)
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of the file.
    pub fn metadata(&self) -> &FileMetaData {
        &self.metadata
    }

    /// Size of the header.
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Current file size, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size of the record data.
    pub fn data_size(&self) -> u64 {
        self.size - self.header_size
    }
}

/// Reads bytes `[start, end)` of the file at `path` through a fresh handle,
/// so that reads never move the append position of the writer.
pub fn read_data(path: &Path, start: u64, end: u64) -> Result<Bytes> {
    if end <= start {
        return Ok(Bytes::new());
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn partition() -> PartitionId {
        PartitionId::new("db", "cpu", TimeRange::new(0, 3_600))
    }

    fn create_test_file() -> (TempDir, TimeSeriesFile) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.ts");
        let file = TimeSeriesFile::open(&path, &partition(), None).unwrap();
        (temp_dir, file)
    }

    #[test]
    fn test_metadata_round_trip() {
        let metadata = FileMetaData::new(&partition());
        let bytes = metadata.encoded().unwrap();
        let decoded = FileMetaData::read_from(&mut ReadBuffer::new(bytes)).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_corrupted_header_detected() {
        let bytes = FileMetaData::new(&partition()).encoded().unwrap();
        let mut damaged = bytes.to_vec();
        damaged[3] ^= 0xff;
        let result = FileMetaData::read_from(&mut ReadBuffer::new(Bytes::from(damaged)));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_create_writes_header_only() {
        let (temp_dir, file) = create_test_file();
        assert_eq!(file.size(), file.header_size());
        assert_eq!(file.data_size(), 0);
        assert!(!temp_dir.path().join("0.ts.tmp").exists());
        assert_eq!(file.metadata(), &FileMetaData::new(&partition()));
    }

    #[test]
    fn test_append_and_read() {
        let (_temp_dir, mut file) = create_test_file();
        let size = file
            .append(&[Bytes::from_static(b"abc"), Bytes::from_static(b"de")])
            .unwrap();
        assert_eq!(size, file.header_size() + 5);
        assert_eq!(file.read_data(size).unwrap().as_ref(), b"abcde");

        file.append(&[Bytes::from_static(b"f")]).unwrap();
        assert_eq!(file.read_data(size).unwrap().as_ref(), b"abcde");
        assert_eq!(file.read_data(file.size()).unwrap().as_ref(), b"abcdef");
    }

    #[test]
    fn test_reopen_truncates_incomplete_flush() {
        let (temp_dir, mut file) = create_test_file();
        let committed = file.append(&[Bytes::from_static(b"abc")]).unwrap();
        file.append(&[Bytes::from_static(b"partial")]).unwrap();
        drop(file);

        let path = temp_dir.path().join("0.ts");
        let file = TimeSeriesFile::open(&path, &partition(), Some(committed)).unwrap();
        assert_eq!(file.size(), committed);
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        assert_eq!(file.read_data(file.size()).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_truncate_discards_appended_data() {
        let (temp_dir, mut file) = create_test_file();
        let committed = file.append(&[Bytes::from_static(b"abc")]).unwrap();
        file.append(&[Bytes::from_static(b"def")]).unwrap();
        file.truncate(committed).unwrap();
        assert_eq!(file.size(), committed);
        assert_eq!(fs::metadata(temp_dir.path().join("0.ts")).unwrap().len(), committed);

        file.append(&[Bytes::from_static(b"g")]).unwrap();
        assert_eq!(file.read_data(file.size()).unwrap().as_ref(), b"abcg");
    }

    #[test]
    fn test_reopen_before_first_flush_keeps_header_only() {
        let (temp_dir, mut file) = create_test_file();
        file.append(&[Bytes::from_static(b"lost")]).unwrap();
        drop(file);

        let file = TimeSeriesFile::open(temp_dir.path().join("0.ts"), &partition(), Some(0)).unwrap();
        assert_eq!(file.data_size(), 0);
    }

    #[test]
    fn test_reopen_shorter_than_expected() {
        let (temp_dir, file) = create_test_file();
        let size = file.size();
        drop(file);
        let result = TimeSeriesFile::open(temp_dir.path().join("0.ts"), &partition(), Some(size + 10));
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_header_of_other_partition_rejected() {
        let (temp_dir, file) = create_test_file();
        drop(file);
        let other = PartitionId::new("db", "cpu", TimeRange::new(3_600, 7_200));
        let result = TimeSeriesFile::open(temp_dir.path().join("0.ts"), &other, None);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_missing_file_with_expected_size() {
        let temp_dir = TempDir::new().unwrap();
        let result = TimeSeriesFile::open(temp_dir.path().join("0.ts"), &partition(), Some(100));
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }
}
