//! Error types for mirror operations.
//!
//! Structural failures (`ManifestLoadError`, fatal `ScanError`, `PublishError`)
//! abort a run and surface as [`MirrorError`]. Per-item failures are
//! [`TransferError`] values carried inside a `TransferOutcome` and never abort
//! sibling transfers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that abort a mirror run.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The remote manifest could not be fetched or parsed.
    #[error(transparent)]
    ManifestLoad(#[from] ManifestLoadError),

    /// The destination could not be enumerated.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The new manifest could not be staged or swapped in.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Invalid run parameters.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error outside of a single transfer.
    #[error(transparent)]
    IoError(#[from] io::Error),
}

/// Malformed or unreachable manifest artifact.
#[derive(Error, Debug)]
pub enum ManifestLoadError {
    /// Transport failure reaching the manifest.
    #[error("Failed to fetch manifest from {location}: {source}")]
    Unreachable {
        location: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("Failed to fetch manifest from {location}: HTTP {status}")]
    Status {
        location: String,
        status: reqwest::StatusCode,
    },

    /// Local read failure.
    #[error("Failed to read manifest {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: io::Error,
    },

    /// Not a readable Parquet file.
    #[error("Invalid Parquet manifest: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Column could not be decoded into the expected type.
    #[error("Invalid manifest column: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// A required column is absent from the schema.
    #[error("Manifest is missing required column '{0}'")]
    MissingColumn(String),

    /// A non-nullable column holds a null.
    #[error("Manifest column '{column}' is null at row {row}")]
    NullValue { column: &'static str, row: usize },

    /// `sha256` is not 64 lowercase hex characters.
    #[error("Malformed sha256 '{value}' for '{key}'")]
    InvalidHash { key: String, value: String },

    /// `internal_location` is not a safe relative path.
    #[error("Invalid internal_location '{0}'")]
    InvalidKey(String),

    /// `size` is negative.
    #[error("Negative size {size} for '{key}'")]
    NegativeSize { key: String, size: i64 },
}

/// Destination enumeration failure.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The destination root exists but cannot be read.
    #[error("Destination root {} is not readable: {source}", .root.display())]
    RootUnreadable {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination's published manifest could not be loaded.
    #[error("Failed to load destination manifest: {0}")]
    Manifest(#[from] ManifestLoadError),

    /// The destination store could not be reached.
    #[error("Failed to read destination: {0}")]
    Store(#[from] StoreError),

    /// A blocking scan task panicked or was cancelled.
    #[error("Scan task failed: {0}")]
    Task(String),
}

/// Failure talking to a local or HTTP object store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP transport error.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("{method} {url} returned HTTP {status}")]
    Status {
        method: &'static str,
        url: String,
        status: reqwest::StatusCode,
    },

    /// The key cannot be resolved inside the store.
    #[error("Refusing to resolve unsafe key '{0}'")]
    InvalidKey(String),
}

/// Why a single item transfer failed.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The streamed content does not hash to the expected digest.
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// The streamed byte count differs from the manifest size.
    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The object store acknowledged an upload with a different ETag.
    #[error("upload ETag mismatch: local md5 {expected}, store returned {actual}")]
    ETagMismatch { expected: String, actual: String },

    /// Network or storage failure mid-stream.
    #[error(transparent)]
    Io(#[from] StoreError),

    /// The concurrency limiter was closed before a slot was granted.
    #[error("concurrency limiter closed")]
    LimiterClosed,

    /// The worker task panicked.
    #[error("transfer task failed: {0}")]
    Panicked(String),
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(StoreError::IoError(e))
    }
}

impl TransferError {
    /// Coarse classification used in reports.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::IntegrityMismatch { .. }
            | TransferError::SizeMismatch { .. }
            | TransferError::ETagMismatch { .. } => FailureKind::Integrity,
            TransferError::Io(_) => FailureKind::Io,
            TransferError::LimiterClosed | TransferError::Panicked(_) => FailureKind::Internal,
        }
    }
}

/// Failure class of a per-item error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Integrity,
    Io,
    Internal,
}

/// Manifest swap failure.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The snapshot could not be serialized.
    #[error("Failed to encode manifest: {0}")]
    Encode(String),

    /// Staging or renaming the local artifact failed.
    #[error("Failed to write manifest to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Uploading to the object store failed.
    #[error("Failed to upload manifest: {0}")]
    Store(#[from] StoreError),
}

impl From<parquet::errors::ParquetError> for PublishError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        PublishError::Encode(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for PublishError {
    fn from(e: arrow::error::ArrowError) -> Self {
        PublishError::Encode(e.to_string())
    }
}
