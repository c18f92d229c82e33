//! # revkv CLI
//!
//! Command line harness for the revkv backend.
//!
//! This crate provides:
//! - **Smoke**: The create, update, conflict and as-of read walkthrough
//! - **Bench**: Concurrent update throughput over independent keys
//! - **Config**: Defaults, an optional file and `REVKV_*` overrides
//!
//! Both commands run against the in-memory row store, so every run starts
//! from an empty medium.

pub mod bench;
pub mod config;
pub mod smoke;

pub use bench::{run_bench, BenchOptions, BenchReport};
pub use config::NodeConfig;
pub use smoke::{run_smoke, SmokeReport};

use revkv_core::{Backend, BroadcastSink};
use revkv_rowstore::MemoryRowStore;
use std::sync::Arc;

/// Build a backend over a fresh in-memory medium
pub fn build_backend(
    config: &NodeConfig,
) -> anyhow::Result<(Backend<MemoryRowStore>, Arc<BroadcastSink>)> {
    let medium = Arc::new(MemoryRowStore::with_max_row_size(config.medium_max_row_size));
    let sink = Arc::new(BroadcastSink::new(config.backend.event_channel_capacity));
    let backend = Backend::new(medium, config.backend.clone())?.with_event_sink(sink.clone());
    Ok((backend, sink))
}
