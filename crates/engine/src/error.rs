//! Error and Result types for HorizonDB storage operations.
//!
//! Every error maps to a stable numeric [`ErrorCode`] and to an [`ErrorKind`]
//! so that client-facing layers can tell domain errors (never retried) apart
//! from integrity and I/O failures.

use std::fmt;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for storage engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric code carried by every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Unexpected internal failure.
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(1);
    /// Underlying file system failure.
    pub const IO_ERROR: ErrorCode = ErrorCode(2);
    /// Checksum mismatch or malformed persisted data.
    pub const DATA_CORRUPTION: ErrorCode = ErrorCode(3);
    /// Start or shutdown aborted before completion.
    pub const INTERRUPTED: ErrorCode = ErrorCode(4);
    /// The database does not exist.
    pub const UNKNOWN_DATABASE: ErrorCode = ErrorCode(100);
    /// A database with the same name already exists.
    pub const DUPLICATE_DATABASE: ErrorCode = ErrorCode(101);
    /// The time series does not exist.
    pub const UNKNOWN_TIMESERIES: ErrorCode = ErrorCode(102);
    /// A time series with the same name already exists.
    pub const DUPLICATE_TIMESERIES: ErrorCode = ErrorCode(103);
    /// The records sent for a write cannot be applied.
    pub const INVALID_RECORD_SET: ErrorCode = ErrorCode(104);
    /// A definition or configuration is not valid.
    pub const INVALID_SCHEMA: ErrorCode = ErrorCode(105);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller sent something the engine refuses (duplicate name, bad records).
    Domain,
    /// Persisted bytes failed validation.
    Integrity,
    /// The file system failed.
    Io,
    /// The engine is starting, stopping or was interrupted.
    Lifecycle,
    /// A bug or broken internal invariant.
    Internal,
}

/// The error type for storage engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Checksum computed over persisted bytes does not match the stored one.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored alongside the data.
        expected: u64,
        /// Checksum computed over the data read.
        actual: u64,
    },

    /// Persisted data is malformed.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A read went past the end of the available bytes.
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEndOfData {
        /// Bytes requested.
        needed: usize,
        /// Bytes that were still readable.
        remaining: usize,
    },

    /// A database with this name already exists.
    #[error("Duplicate database: {0}")]
    DuplicateDatabase(String),

    /// No database with this name exists.
    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    /// A time series with this name already exists in the database.
    #[error("Duplicate time series: {database}.{series}")]
    DuplicateTimeSeries {
        /// Database name.
        database: String,
        /// Time series name.
        series: String,
    },

    /// No time series with this name exists in the database.
    #[error("Unknown time series: {database}.{series}")]
    UnknownTimeSeries {
        /// Database name.
        database: String,
        /// Time series name.
        series: String,
    },

    /// The records of a write cannot be applied to the partition.
    #[error("Invalid record set: {0}")]
    InvalidRecordSet(String),

    /// A database or time series definition is not valid.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// An engine configuration value is not valid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A start or shutdown sequence was aborted before completing.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The engine is shutting down and refuses new work.
    #[error("Storage engine is shutting down")]
    ShuttingDown,

    /// The commit log could not make a write durable.
    #[error("Commit log failure: {0}")]
    CommitLogFailed(String),

    /// Broken internal invariant.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the stable numeric code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ChecksumMismatch { .. }
            | Error::Corrupted(_)
            | Error::UnexpectedEndOfData { .. } => ErrorCode::DATA_CORRUPTION,
            Error::DuplicateDatabase(_) => ErrorCode::DUPLICATE_DATABASE,
            Error::UnknownDatabase(_) => ErrorCode::UNKNOWN_DATABASE,
            Error::DuplicateTimeSeries { .. } => ErrorCode::DUPLICATE_TIMESERIES,
            Error::UnknownTimeSeries { .. } => ErrorCode::UNKNOWN_TIMESERIES,
            Error::InvalidRecordSet(_) => ErrorCode::INVALID_RECORD_SET,
            Error::InvalidSchema(_) | Error::InvalidConfig(_) => ErrorCode::INVALID_SCHEMA,
            Error::Io(_) | Error::CommitLogFailed(_) => ErrorCode::IO_ERROR,
            Error::Interrupted(_) | Error::ShuttingDown => ErrorCode::INTERRUPTED,
            Error::Internal(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ChecksumMismatch { .. }
            | Error::Corrupted(_)
            | Error::UnexpectedEndOfData { .. } => ErrorKind::Integrity,
            Error::DuplicateDatabase(_)
            | Error::UnknownDatabase(_)
            | Error::DuplicateTimeSeries { .. }
            | Error::UnknownTimeSeries { .. }
            | Error::InvalidRecordSet(_)
            | Error::InvalidSchema(_)
            | Error::InvalidConfig(_) => ErrorKind::Domain,
            Error::Io(_) | Error::CommitLogFailed(_) => ErrorKind::Io,
            Error::Interrupted(_) | Error::ShuttingDown => ErrorKind::Lifecycle,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if retrying the operation might succeed.
    ///
    /// Domain and integrity errors are deterministic and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Lifecycle)
    }

    pub(crate) fn corrupted(message: impl Into<String>) -> Self {
        Error::Corrupted(message.into())
    }

    pub(crate) fn invalid_record_set(message: impl Into<String>) -> Self {
        Error::InvalidRecordSet(message.into())
    }
}
