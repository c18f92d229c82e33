//! Concurrent update throughput

use crate::config::NodeConfig;
use bytes::Bytes;
use revkv_core::Revision;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Workload shape
#[derive(Debug, Clone)]
pub struct BenchOptions {
    /// Concurrent writers, each owning one key
    pub writers: usize,
    /// Updates issued by each writer
    pub updates_per_writer: usize,
    /// Value size in bytes
    pub value_size: usize,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            writers: 8,
            updates_per_writer: 100,
            value_size: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchReport {
    pub operations: usize,
    pub elapsed: Duration,
    pub final_revision: Revision,
}

impl BenchReport {
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return self.operations as f64;
        }
        self.operations as f64 / secs
    }
}

/// Run independent update loops, one key per writer
pub async fn run_bench(config: &NodeConfig, options: &BenchOptions) -> anyhow::Result<BenchReport> {
    let (backend, _) = crate::build_backend(config)?;
    let backend = Arc::new(backend);
    let value = Bytes::from(vec![0x5a; options.value_size]);

    let started = Instant::now();
    let tasks = (0..options.writers).map(|writer| {
        let backend = Arc::clone(&backend);
        let value = value.clone();
        let updates = options.updates_per_writer;
        tokio::spawn(async move {
            let key = format!("/bench/{:04}", writer);
            let mut revision = backend.insert(key.as_bytes(), value.clone(), 0).await?;
            for _ in 0..updates {
                revision = backend
                    .update(key.as_bytes(), value.clone(), revision, 0)
                    .await?
                    .mod_revision();
            }
            Ok::<_, revkv_core::KvError>(updates + 1)
        })
    });

    let mut operations = 0;
    for result in futures::future::join_all(tasks).await {
        operations += result??;
    }
    let elapsed = started.elapsed();

    let report = BenchReport {
        operations,
        elapsed,
        final_revision: backend.current_revision().await?,
    };
    info!(
        operations = report.operations,
        elapsed_ms = report.elapsed.as_millis() as u64,
        ops_per_second = report.ops_per_second(),
        final_revision = report.final_revision,
        "Bench complete"
    );
    Ok(report)
}
