//! Error types for the revkv-rowstore crate

use thiserror::Error;

/// Result type alias using `RowStoreError`
pub type Result<T> = std::result::Result<T, RowStoreError>;

/// Errors that can occur during row storage operations
#[derive(Error, Debug, Clone)]
pub enum RowStoreError {
    /// Row not found
    #[error("row not found: {0}")]
    NotFound(String),

    /// Conditional write rejected
    #[error("precondition failed for row {key}: expected {expected}")]
    PreconditionFailed { key: String, expected: String },

    /// Row payload too large
    #[error("row too large: {size} bytes exceeds maximum {max} bytes")]
    RowTooLarge { size: usize, max: usize },

    /// Invalid row key
    #[error("invalid row key: {0}")]
    InvalidRowKey(String),

    /// Timeout error
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Medium temporarily unavailable
    #[error("storage medium unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Chunk set does not match its manifest
    #[error("chunk mismatch: {0}")]
    ChunkMismatch(String),

    /// Hash mismatch
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RowStoreError {
    /// Whether the error reports a missing row
    pub fn is_not_found(&self) -> bool {
        matches!(self, RowStoreError::NotFound(_))
    }

    /// Whether the error reports a rejected conditional write
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, RowStoreError::PreconditionFailed { .. })
    }

    /// Whether the operation may succeed if the caller tries again
    pub fn is_retryable(&self) -> bool {
        matches!(self, RowStoreError::Timeout { .. } | RowStoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for RowStoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            RowStoreError::Deserialization(err.to_string())
        } else {
            RowStoreError::Serialization(err.to_string())
        }
    }
}
