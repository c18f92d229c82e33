//! Error types for the revkv-core crate

use crate::record::{Record, Revision};
use bytes::Bytes;
use revkv_rowstore::RowStoreError;
use thiserror::Error;

/// Result type alias using `KvError`
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors that can occur in backend operations
///
/// Callers should branch on the predicates (`is_not_found`, `is_conflict`,
/// ...) rather than matching variants directly.
#[derive(Error, Debug)]
pub enum KvError {
    /// Key has no live version at the requested revision
    #[error("key not found: {}", display_key(.key))]
    NotFound { key: Bytes },

    /// Expected revision did not match the current mod revision
    #[error("revision conflict on {}: expected {expected}, current {}", display_key(.current.key()), .current.mod_revision())]
    Conflict {
        expected: Revision,
        current: Box<Record>,
    },

    /// Key is already live
    #[error("key already exists: {}", display_key(.key))]
    AlreadyExists { key: Bytes },

    /// Requested revision was removed by compaction
    #[error("revision {requested} has been compacted (floor {floor})")]
    Compacted { requested: Revision, floor: Revision },

    /// Requested revision has not been allocated yet
    #[error("revision {requested} is in the future (current {current})")]
    FutureRevision { requested: Revision, current: Revision },

    /// Invalid key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Stored rows could not be decoded into a record
    #[error("corrupt record {}: {reason}", display_key(.key))]
    Corruption { key: Bytes, reason: String },

    /// Revision counter could not be advanced
    #[error("revision allocator gave up after {attempts} contended attempts")]
    AllocatorContention { attempts: usize },

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage medium error
    #[error("storage error: {0}")]
    Storage(#[from] RowStoreError),
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, KvError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, KvError::AlreadyExists { .. })
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, KvError::Compacted { .. })
    }

    /// Whether the operation may succeed if re-issued with the same arguments
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage(err) => err.is_retryable(),
            KvError::AllocatorContention { .. } => true,
            _ => false,
        }
    }

    /// The record observed by a failed compare-and-swap
    pub fn current_record(&self) -> Option<&Record> {
        match self {
            KvError::Conflict { current, .. } => Some(current.as_ref()),
            _ => None,
        }
    }

    /// Take the record observed by a failed compare-and-swap
    pub fn into_current_record(self) -> Option<Record> {
        match self {
            KvError::Conflict { current, .. } => Some(*current),
            _ => None,
        }
    }

    pub(crate) fn not_found(key: &[u8]) -> Self {
        KvError::NotFound {
            key: Bytes::copy_from_slice(key),
        }
    }

    pub(crate) fn corruption(key: &[u8], reason: impl Into<String>) -> Self {
        KvError::Corruption {
            key: Bytes::copy_from_slice(key),
            reason: reason.into(),
        }
    }
}

pub(crate) fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
