//! HorizonDB time series storage engine.
//!
//! This crate provides the storage layer of HorizonDB: the catalogs of
//! databases and time series, the write-ahead commit log and the partition
//! files holding the records.
//!
//! # Components
//!
//! - [`BTree`]: copy-on-write B+Tree over a checksummed block file, used for
//!   the catalogs and the partition metadata
//! - [`CommitLog`]: memory-mapped, segment-based write-ahead log
//! - [`TimeSeriesPartition`]: delta-encoded in-memory buffer backed by an
//!   append-only partition file
//! - [`StorageEngine`]: facade tying them together, with crash recovery by
//!   commit log replay
//!
//! # Example
//!
//! ```rust,no_run
//! use horizondb_engine::model::{Field, FieldType, Record, RecordTypeDefinition, TimeRange};
//! use horizondb_engine::{DatabaseDefinition, EngineConfig, StorageEngine, TimeSeriesDefinition};
//!
//! # fn main() -> horizondb_engine::Result<()> {
//! let engine = StorageEngine::start(EngineConfig::new("/var/lib/horizondb"))?;
//! engine.create_database(DatabaseDefinition::new("metrics"), false)?;
//! engine.create_time_series(
//!     TimeSeriesDefinition::new("metrics", "cpu").with_record_type(
//!         RecordTypeDefinition::new("load").with_field("value", FieldType::Long),
//!     ),
//!     false,
//! )?;
//!
//! let record = Record::new(0, vec![Field::Timestamp(1_000), Field::Long(42)]);
//! engine.write("metrics", "cpu", 1_000, &[record])?.wait()?;
//!
//! for record in engine.read("metrics", "cpu", TimeRange::new(0, 2_000))? {
//!     println!("{}", record?);
//! }
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod btree;
pub mod commitlog;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod manager;
pub mod model;
pub mod series;

pub use btree::BTree;
pub use commitlog::{CommitLog, ReplayPosition, WriteFuture};
pub use config::{CommitLogConfig, EngineConfig, SyncMode};
pub use engine::StorageEngine;
pub use error::{Error, ErrorCode, ErrorKind, Result};
pub use model::{DatabaseDefinition, PartitionId, Record, TimeRange, TimeSeriesDefinition};
pub use series::TimeSeriesPartition;
