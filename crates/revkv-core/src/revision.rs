//! Revision allocation
//!
//! Every successful mutation consumes one revision from a single counter
//! shared by all keys. [`StoredRevisionAllocator`] keeps the counter in a row
//! of the storage medium so several backend instances can share it;
//! [`MemoryRevisionAllocator`] is the single-process alternative.

use crate::error::{KvError, Result};
use crate::record::Revision;
use async_trait::async_trait;
use bytes::Bytes;
use revkv_rowstore::{Precondition, RowStore, RowStoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Row holding the persisted revision counter
pub const REVISION_COUNTER_ROW: &str = "m/revision";

/// Source of globally increasing revisions
#[async_trait]
pub trait RevisionAllocator: Send + Sync {
    /// Allocate a revision strictly greater than every one handed out before
    async fn next(&self) -> Result<Revision>;

    /// Highest revision handed out so far (0 if none)
    async fn current(&self) -> Result<Revision>;
}

/// Process-local revision counter
#[derive(Debug, Default)]
pub struct MemoryRevisionAllocator {
    counter: AtomicU64,
}

impl MemoryRevisionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `revision`
    pub fn starting_after(revision: Revision) -> Self {
        Self {
            counter: AtomicU64::new(revision),
        }
    }
}

#[async_trait]
impl RevisionAllocator for MemoryRevisionAllocator {
    async fn next(&self) -> Result<Revision> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn current(&self) -> Result<Revision> {
        Ok(self.counter.load(Ordering::SeqCst))
    }
}

/// Revision counter persisted in the storage medium
///
/// The counter row is advanced with an etag-guarded replace. Callers in the
/// same process queue on a local mutex, so only other instances can make the
/// conditional write fail; those failures are retried up to `max_attempts`.
pub struct StoredRevisionAllocator<S: RowStore> {
    store: Arc<S>,
    row_key: String,
    max_attempts: usize,
    local: Mutex<()>,
}

impl<S: RowStore> StoredRevisionAllocator<S> {
    /// Create an allocator over the default counter row
    pub fn new(store: Arc<S>, max_attempts: usize) -> Self {
        Self::with_row_key(store, REVISION_COUNTER_ROW, max_attempts)
    }

    /// Create an allocator over a custom counter row
    pub fn with_row_key(store: Arc<S>, row_key: impl Into<String>, max_attempts: usize) -> Self {
        Self {
            store,
            row_key: row_key.into(),
            max_attempts: max_attempts.max(1),
            local: Mutex::new(()),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Revision> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| {
            KvError::Storage(RowStoreError::Deserialization(format!(
                "revision counter row {} holds {} bytes",
                self.row_key,
                data.len()
            )))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

fn encode(revision: Revision) -> Bytes {
    Bytes::copy_from_slice(&revision.to_be_bytes())
}

#[async_trait]
impl<S: RowStore + 'static> RevisionAllocator for StoredRevisionAllocator<S> {
    #[instrument(skip(self), fields(row = %self.row_key))]
    async fn next(&self) -> Result<Revision> {
        let _guard = self.local.lock().await;

        for attempt in 1..=self.max_attempts {
            let (current, precondition) = match self.store.get_row(&self.row_key).await {
                Ok(row) => (self.decode(&row.data)?, Precondition::Etag(row.etag)),
                Err(RowStoreError::NotFound(_)) => (0, Precondition::Absent),
                Err(e) => return Err(e.into()),
            };

            let next = current + 1;
            match self
                .store
                .put_row(&self.row_key, encode(next), precondition)
                .await
            {
                Ok(_) => return Ok(next),
                Err(e) if e.is_precondition_failed() => {
                    tracing::debug!(attempt, current, "Revision counter moved, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(attempts = self.max_attempts, "Revision counter contention");
        Err(KvError::AllocatorContention {
            attempts: self.max_attempts,
        })
    }

    async fn current(&self) -> Result<Revision> {
        match self.store.get_row(&self.row_key).await {
            Ok(row) => self.decode(&row.data),
            Err(RowStoreError::NotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
