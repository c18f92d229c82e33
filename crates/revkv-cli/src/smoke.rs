//! Walkthrough of the core backend operations

use crate::config::NodeConfig;
use bytes::Bytes;
use rand::RngCore;
use revkv_core::{Backend, EventKind, Revision};
use revkv_rowstore::{calculate_chunk_count, MemoryRowStore};
use tracing::info;

/// Key written by the walkthrough
pub const SMOKE_KEY: &[u8] = b"/a/b/c";

/// Size of the initial value
pub const INITIAL_VALUE_SIZE: usize = 1024 * 1024;

/// Revisions observed during a smoke run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeReport {
    pub created: Revision,
    pub first_update: Revision,
    pub second_update: Revision,
    pub chunks_per_update: usize,
    pub events: usize,
}

fn random_value(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Run the walkthrough against a fresh backend
pub async fn run_smoke(config: &NodeConfig) -> anyhow::Result<SmokeReport> {
    let (backend, sink) = crate::build_backend(config)?;
    let mut events = sink.subscribe();
    let report = walkthrough(&backend, config.backend.max_row_size).await?;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        info!(
            kind = event.kind.as_str(),
            revision = event.revision(),
            "Observed event"
        );
        seen.push(event.kind);
    }
    anyhow::ensure!(
        seen == expected_events(),
        "unexpected event sequence {:?}",
        seen
    );

    Ok(SmokeReport {
        events: seen.len(),
        ..report
    })
}

async fn walkthrough(
    backend: &Backend<MemoryRowStore>,
    max_row_size: usize,
) -> anyhow::Result<SmokeReport> {
    let initial = random_value(INITIAL_VALUE_SIZE);
    let created = backend.insert(SMOKE_KEY, initial.clone(), 1).await?;
    info!(revision = created, size = initial.len(), "Inserted");

    let update_size = 3 * max_row_size;
    let first = random_value(update_size);
    let updated = backend.update(SMOKE_KEY, first.clone(), created, 1).await?;
    anyhow::ensure!(updated.mod_revision() > created, "mod revision did not advance");
    anyhow::ensure!(updated.create_revision() == created, "create revision changed");
    anyhow::ensure!(updated.prev_revision() == created, "prev revision is wrong");
    info!(revision = updated.mod_revision(), size = update_size, "Updated");

    let (record, current) = backend.get(SMOKE_KEY, updated.mod_revision()).await?;
    anyhow::ensure!(record.value() == &first, "as-of read returned the wrong value");
    anyhow::ensure!(current >= updated.mod_revision(), "current revision went backwards");

    let second = random_value(update_size);
    let again = backend
        .update(SMOKE_KEY, second.clone(), updated.mod_revision(), 1)
        .await?;
    anyhow::ensure!(again.prev_revision() == updated.mod_revision(), "prev revision is wrong");
    info!(revision = again.mod_revision(), "Updated again");

    // The first update is still readable as of its own revision
    let (older, _) = backend.get(SMOKE_KEY, updated.mod_revision()).await?;
    anyhow::ensure!(older.value() == &first, "history lost the first update");

    // A stale update is refused and hands back the current record
    match backend
        .update(SMOKE_KEY, Bytes::from_static(b"newVal"), again.mod_revision() + 1000, 1)
        .await
    {
        Err(e) if e.is_conflict() => {
            let current = e
                .into_current_record()
                .ok_or_else(|| anyhow::anyhow!("conflict without current record"))?;
            anyhow::ensure!(current.value() == &second, "conflict carried a stale value");
            info!(revision = current.mod_revision(), "Stale update refused");
        }
        Err(e) => return Err(e.into()),
        Ok(_) => anyhow::bail!("stale update was accepted"),
    }

    match backend
        .update(b"idontexist", Bytes::from_static(b"someval"), 79, 1)
        .await
    {
        Err(e) if e.is_not_found() => info!("Update of a missing key refused"),
        Err(e) => return Err(e.into()),
        Ok(_) => anyhow::bail!("update of a missing key was accepted"),
    }

    Ok(SmokeReport {
        created,
        first_update: updated.mod_revision(),
        second_update: again.mod_revision(),
        chunks_per_update: calculate_chunk_count(update_size as u64, max_row_size),
        events: 0,
    })
}

/// Kinds of event the walkthrough produces, in order
pub fn expected_events() -> [EventKind; 3] {
    [EventKind::Create, EventKind::Update, EventKind::Update]
}
