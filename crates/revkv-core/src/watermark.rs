//! Readable revision tracking
//!
//! Revisions are allocated before the write that consumes them commits, and
//! writes to different keys commit in any order. A revision is readable once
//! it and every lower revision handed out here have committed or been
//! abandoned.

use crate::error::Result;
use crate::record::Revision;
use crate::revision::RevisionAllocator;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

type PendingSet = Arc<Mutex<BTreeSet<Revision>>>;

/// Allocates revisions and tracks the ones still in flight
pub struct CommitWatermark {
    allocator: Arc<dyn RevisionAllocator>,
    /// Orders allocation against readers so a fresh revision is never seen
    /// before it is registered as pending
    ordering: tokio::sync::Mutex<()>,
    pending: PendingSet,
}

/// A revision held by a write in progress, released when dropped
#[derive(Debug)]
pub struct PendingRevision {
    revision: Revision,
    pending: PendingSet,
}

impl PendingRevision {
    pub fn revision(&self) -> Revision {
        self.revision
    }
}

impl Drop for PendingRevision {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.revision);
    }
}

impl CommitWatermark {
    pub fn new(allocator: Arc<dyn RevisionAllocator>) -> Self {
        Self {
            allocator,
            ordering: tokio::sync::Mutex::new(()),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Allocate a revision for a write about to be committed
    pub async fn allocate(&self) -> Result<PendingRevision> {
        let _order = self.ordering.lock().await;
        let revision = self.allocator.next().await?;
        self.pending.lock().insert(revision);
        Ok(PendingRevision {
            revision,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Highest revision below which nothing is still in flight
    pub async fn readable(&self) -> Result<Revision> {
        let _order = self.ordering.lock().await;
        let allocated = self.allocator.current().await?;
        let lowest_pending = self.pending.lock().first().copied();
        Ok(match lowest_pending {
            Some(lowest) => allocated.min(lowest.saturating_sub(1)),
            None => allocated,
        })
    }

    /// Number of writes holding a revision
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}
