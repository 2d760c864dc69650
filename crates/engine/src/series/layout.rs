//! On-disk layout of the data directory.
//!
//! ```text
//! data_dir/
//!   databases.b3
//!   timeseries.b3
//!   partitions.b3
//!   <database>/<series>/<range start>.ts
//! ```

use crate::error::Result;
use crate::model::PartitionId;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// B+Tree file holding the database definitions.
pub const DATABASES_FILE: &str = "databases.b3";

/// B+Tree file holding the time series definitions.
pub const TIME_SERIES_FILE: &str = "timeseries.b3";

/// B+Tree file holding the partition metadata.
pub const PARTITIONS_FILE: &str = "partitions.b3";

/// Partition file extension.
pub const PARTITION_EXTENSION: &str = "ts";

/// Provides filesystem paths for metadata trees and partition files.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    data_dir: PathBuf,
}

impl PartitionLayout {
    /// Creates a layout rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of a metadata tree file such as [`DATABASES_FILE`].
    pub fn metadata_path(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Directory holding the partition files of a time series.
    pub fn series_dir(&self, database: &str, series: &str) -> PathBuf {
        self.data_dir.join(database).join(series)
    }

    /// Path of the file of a partition.
    pub fn partition_path(&self, id: &PartitionId) -> PathBuf {
        self.series_dir(&id.database, &id.series)
            .join(format!("{}.{}", id.range.start, PARTITION_EXTENSION))
    }

    /// Creates the directory of a partition file and syncs its parent.
    pub fn ensure_partition_dir(&self, id: &PartitionId) -> Result<PathBuf> {
        let dir = self.series_dir(&id.database, &id.series);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            sync_dir(&self.data_dir)?;
        }
        Ok(dir)
    }
}

/// Fsyncs a directory so that new entries in it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeRange;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let layout = PartitionLayout::new("/data");
        let id = PartitionId::new("metrics", "cpu", TimeRange::new(-3_600, 0));
        assert_eq!(
            layout.partition_path(&id),
            PathBuf::from("/data/metrics/cpu/-3600.ts")
        );
        assert_eq!(
            layout.metadata_path(DATABASES_FILE),
            PathBuf::from("/data/databases.b3")
        );
    }

    #[test]
    fn test_ensure_partition_dir() {
        let temp_dir = TempDir::new().unwrap();
        let layout = PartitionLayout::new(temp_dir.path());
        let id = PartitionId::new("db", "ts", TimeRange::new(0, 3_600));
        let dir = layout.ensure_partition_dir(&id).unwrap();
        assert!(dir.is_dir());
        assert_eq!(layout.partition_path(&id).parent(), Some(dir.as_path()));
        assert_eq!(layout.ensure_partition_dir(&id).unwrap(), dir);
    }
}
