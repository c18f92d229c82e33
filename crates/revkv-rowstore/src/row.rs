//! Row types and write preconditions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque version tag assigned by the medium on every successful write
pub type Etag = u64;

/// A stored row with its current etag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    /// The raw payload
    pub data: Bytes,
    /// Version tag of this payload
    pub etag: Etag,
}

impl Row {
    /// Create a new row
    pub fn new(data: Bytes, etag: Etag) -> Self {
        Self { data, etag }
    }

    /// Get the payload size
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the payload as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Condition a write must satisfy to be applied
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Precondition {
    /// Unconditional
    #[default]
    Any,
    /// The row must not exist
    Absent,
    /// The row must exist with exactly this etag
    Etag(Etag),
}

impl Precondition {
    /// Check the precondition against the row's current etag, if any
    pub fn holds(&self, current: Option<Etag>) -> bool {
        match (self, current) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Absent, Some(_)) => false,
            (Precondition::Etag(expected), Some(actual)) => *expected == actual,
            (Precondition::Etag(_), None) => false,
        }
    }
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precondition::Any => write!(f, "any"),
            Precondition::Absent => write!(f, "absent"),
            Precondition::Etag(etag) => write!(f, "etag:{}", etag),
        }
    }
}
