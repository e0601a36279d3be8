//! Error types for Strata
//!
//! One taxonomy shared by the indexer crates. Admission drops and partial
//! query results are values, not errors.

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Construction / configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // Write path
    #[error("index write failed: {0}")]
    Write(String),

    #[error("chunk {chunk_id} is not accepting writes")]
    ChunkSealed { chunk_id: String },

    // Archival
    #[error("archival of chunk {chunk_id} failed: {reason}")]
    Archival { chunk_id: String, reason: String },

    #[error("blob store error: {0}")]
    BlobStore(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Collaborators
    #[error("coordination directory error: {0}")]
    Coordination(String),

    #[error("broker error: {0}")]
    Broker(String),

    // Lifecycle
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a write error
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    /// Create a coordination error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a blob store error
    pub fn blob_store(msg: impl Into<String>) -> Self {
        Self::BlobStore(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient failures worth another attempt with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BlobStore(_) | Self::Io(_) | Self::ChecksumMismatch { .. }
        )
    }

    /// Failures that must stop ingestion for the partition.
    ///
    /// Write errors and sealed-chunk rejections only affect one message.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Write(_) | Self::ChunkSealed { .. } | Self::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
