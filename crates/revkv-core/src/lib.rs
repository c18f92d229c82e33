//! # revkv Core
//!
//! Revisioned key-value engine layered over a size-limited row store.
//!
//! This crate provides:
//! - **Revisions**: A single global counter stamping every mutation
//! - **Compare-and-swap writes**: Updates and deletes guarded by the expected mod revision
//! - **Chunked records**: Values of any size spread over row-sized chunks and committed atomically
//! - **History**: Reads as of an earlier revision, with compaction
//! - **Events**: Create, update and delete notifications for a watch layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Protocol / API Layer            │
//! ├─────────────────────────────────────────┤
//! │               Backend                   │
//! ├───────────────┬──────────┬──────────────┤
//! │ RevisionAlloc │ EventSink│ RecordStore  │
//! ├───────────────┴──────────┴──────────────┤
//! │        RowStore + Chunker               │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use revkv_core::{Backend, BackendConfig};
//! use revkv_rowstore::MemoryRowStore;
//!
//! let backend = Backend::new(Arc::new(MemoryRowStore::new()), BackendConfig::default())?;
//! let rev = backend.insert(b"/a/b/c", value, lease).await?;
//! match backend.update(b"/a/b/c", new_value, rev, lease).await {
//!     Ok(record) => println!("now at {}", record.mod_revision()),
//!     Err(e) if e.is_conflict() => retry_with(e.current_record()),
//!     Err(e) => return Err(e),
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod record;
pub mod revision;
pub mod store;
pub mod watermark;

pub use backend::{Backend, MAX_KEY_LEN};
pub use config::BackendConfig;
pub use error::{KvError, Result};
pub use event::{BroadcastSink, Event, EventKind, EventSink, NoopSink};
pub use record::{LeaseId, Record, RecordHeader, Revision, RevisionTriple};
pub use revision::{MemoryRevisionAllocator, RevisionAllocator, StoredRevisionAllocator};
pub use store::{CommitOutcome, CompactionStats, RecordStore};
pub use watermark::{CommitWatermark, PendingRevision};
