//! # revkv Rowstore
//!
//! Row storage layer for the revkv revisioned key-value backend.
//!
//! This crate provides:
//! - **Row operations**: Get, put, delete and prefix-scan size-limited rows
//! - **Conditional writes**: Etag preconditions for compare-and-swap
//! - **Chunking**: Split large values into row-sized chunks and verify them on reassembly
//! - **Memory medium**: An in-memory row store with fault injection for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          revkv-core Backend             │
//! ├─────────────────────────────────────────┤
//! │     Chunker      │    RowStore Trait    │
//! ├──────────────────┴──────────────────────┤
//! │   MemoryRowStore │  (external mediums)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use revkv_rowstore::{MemoryRowStore, Precondition, RowStore};
//!
//! let store = MemoryRowStore::new();
//! let etag = store.put_row("k/6162", data, Precondition::Absent).await?;
//! let row = store.get_row("k/6162").await?;
//! ```

pub mod chunker;
pub mod error;
pub mod memory;
pub mod row;

pub use chunker::{calculate_chunk_count, ChunkManifest, CHECKSUM_HEX_LEN, Chunker, ChunkerConfig, EncodedValue};
pub use error::{Result, RowStoreError};
pub use memory::{GatedOp, MemoryRowStore, RowGate};
pub use row::{Etag, Precondition, Row};

use async_trait::async_trait;
use bytes::Bytes;

/// Default maximum payload of a single row (64 KB)
pub const DEFAULT_MAX_ROW_SIZE: usize = 64 * 1024;

/// Upper bound accepted for any configured row size (4 MB)
pub const MAX_ROW_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Trait for row storage mediums
///
/// A medium offers primitive row CRUD with a hard per-row size ceiling.
/// Every write is guarded by a [`Precondition`]; implementations must check
/// the precondition and apply the write atomically with respect to other
/// writers of the same row key.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Largest payload a single row may carry
    fn max_row_size(&self) -> usize;

    /// Retrieve a row by key
    async fn get_row(&self, key: &str) -> Result<Row>;

    /// Write a row if the precondition holds and return its new etag
    async fn put_row(&self, key: &str, data: Bytes, precondition: Precondition) -> Result<Etag>;

    /// Delete a row if the precondition holds
    ///
    /// Deleting a missing row with [`Precondition::Any`] succeeds.
    async fn delete_row(&self, key: &str, precondition: Precondition) -> Result<()>;

    /// List every row whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Row)>>;

    /// Check if a row exists
    async fn has_row(&self, key: &str) -> Result<bool> {
        match self.get_row(key).await {
            Ok(_) => Ok(true),
            Err(RowStoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: RowStore + ?Sized> RowStore for std::sync::Arc<S> {
    fn max_row_size(&self) -> usize {
        (**self).max_row_size()
    }

    async fn get_row(&self, key: &str) -> Result<Row> {
        (**self).get_row(key).await
    }

    async fn put_row(&self, key: &str, data: Bytes, precondition: Precondition) -> Result<Etag> {
        (**self).put_row(key, data, precondition).await
    }

    async fn delete_row(&self, key: &str, precondition: Precondition) -> Result<()> {
        (**self).delete_row(key, precondition).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Row)>> {
        (**self).scan_prefix(prefix).await
    }
}
