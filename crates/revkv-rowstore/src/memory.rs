//! In-memory row store for testing and single-process deployments

use crate::{Etag, Precondition, Result, Row, RowStore, RowStoreError, DEFAULT_MAX_ROW_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Injected behaviour used by tests to simulate a misbehaving medium
#[derive(Debug, Default)]
struct FaultPlan {
    /// Number of upcoming writes to fail
    failing_writes: usize,
    /// Error returned for failed writes
    error: Option<RowStoreError>,
    /// Delay applied before every operation
    latency: Option<Duration>,
    /// Operations parked until released
    gates: Vec<Arc<GateState>>,
    /// Writes applied but reported as failed
    lost_acks: Vec<(String, RowStoreError)>,
}

/// Kind of operation a [`RowGate`] parks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatedOp {
    Read,
    Write,
}

#[derive(Debug)]
struct GateState {
    row_key: String,
    op: GatedOp,
    reached: Notify,
    open: Semaphore,
}

/// Handle to an operation parked on one row
///
/// The gate catches the first matching operation only.
#[derive(Clone, Debug)]
pub struct RowGate {
    state: Arc<GateState>,
}

impl RowGate {
    /// Wait until an operation is parked at the gate
    pub async fn reached(&self) {
        self.state.reached.notified().await;
    }

    /// Let the parked operation proceed
    pub fn release(&self) {
        self.state.open.close();
    }
}

/// An in-memory row store
#[derive(Clone)]
pub struct MemoryRowStore {
    rows: Arc<DashMap<String, Row>>,
    next_etag: Arc<AtomicU64>,
    max_row_size: usize,
    faults: Arc<Mutex<FaultPlan>>,
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRowStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::with_max_row_size(DEFAULT_MAX_ROW_SIZE)
    }

    /// Create a store enforcing a custom row size ceiling
    pub fn with_max_row_size(max_row_size: usize) -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            next_etag: Arc::new(AtomicU64::new(1)),
            max_row_size,
            faults: Arc::new(Mutex::new(FaultPlan::default())),
        }
    }

    /// Get the number of rows stored
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Clear all rows
    pub fn clear(&self) {
        self.rows.clear();
    }

    /// Get total payload size of all rows
    pub fn total_size(&self) -> u64 {
        self.rows.iter().map(|entry| entry.value().size() as u64).sum()
    }

    /// List all row keys, sorted
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.rows.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Fail the next `count` writes (puts and deletes) with `error`
    pub fn fail_next_writes(&self, count: usize, error: RowStoreError) {
        let mut faults = self.faults.lock();
        faults.failing_writes = count;
        faults.error = Some(error);
    }

    /// Delay every subsequent operation by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Park the next `op` on `row_key` until the returned gate is released
    pub fn hold(&self, row_key: impl Into<String>, op: GatedOp) -> RowGate {
        let state = Arc::new(GateState {
            row_key: row_key.into(),
            op,
            reached: Notify::new(),
            open: Semaphore::new(0),
        });
        self.faults.lock().gates.push(Arc::clone(&state));
        RowGate { state }
    }

    /// Apply the next write to `row_key` but report `error` to the writer
    pub fn fail_ack_for(&self, row_key: impl Into<String>, error: RowStoreError) {
        self.faults.lock().lost_acks.push((row_key.into(), error));
    }

    async fn before_op(&self, key: &str, op: GatedOp) {
        let (latency, gate) = {
            let mut faults = self.faults.lock();
            let position = faults
                .gates
                .iter()
                .position(|gate| gate.op == op && gate.row_key == key);
            let gate = position.map(|index| faults.gates.remove(index));
            (faults.latency, gate)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(gate) = gate {
            tracing::debug!(key, ?op, "Parking operation at gate");
            gate.reached.notify_one();
            // A closed semaphore is the release signal
            let _ = gate.open.acquire().await;
        }
    }

    fn take_lost_ack(&self, key: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        let position = faults.lost_acks.iter().position(|(row_key, _)| row_key == key);
        match position {
            Some(index) => Err(faults.lost_acks.remove(index).1),
            None => Ok(()),
        }
    }

    fn take_write_fault(&self) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.failing_writes == 0 {
            return Ok(());
        }
        faults.failing_writes -= 1;
        let error = faults
            .error
            .clone()
            .unwrap_or_else(|| RowStoreError::Unavailable("injected fault".to_string()));
        tracing::debug!(remaining = faults.failing_writes, error = %error, "Injecting write fault");
        Err(error)
    }

    fn allocate_etag(&self) -> Etag {
        self.next_etag.fetch_add(1, Ordering::Relaxed)
    }
}

fn validate_row_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RowStoreError::InvalidRowKey("key cannot be empty".to_string()));
    }
    Ok(())
}

fn rejected(key: &str, precondition: Precondition) -> RowStoreError {
    RowStoreError::PreconditionFailed {
        key: key.to_string(),
        expected: precondition.to_string(),
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn max_row_size(&self) -> usize {
        self.max_row_size
    }

    async fn get_row(&self, key: &str) -> Result<Row> {
        self.before_op(key, GatedOp::Read).await;
        self.rows
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RowStoreError::NotFound(key.to_string()))
    }

    async fn put_row(&self, key: &str, data: Bytes, precondition: Precondition) -> Result<Etag> {
        self.before_op(key, GatedOp::Write).await;
        validate_row_key(key)?;
        if data.len() > self.max_row_size {
            return Err(RowStoreError::RowTooLarge {
                size: data.len(),
                max: self.max_row_size,
            });
        }
        self.take_write_fault()?;

        // The entry guard holds the shard lock across check and write.
        let etag = match self.rows.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !precondition.holds(Some(occupied.get().etag)) {
                    return Err(rejected(key, precondition));
                }
                let etag = self.allocate_etag();
                occupied.insert(Row::new(data, etag));
                etag
            }
            Entry::Vacant(vacant) => {
                if !precondition.holds(None) {
                    return Err(rejected(key, precondition));
                }
                let etag = self.allocate_etag();
                vacant.insert(Row::new(data, etag));
                etag
            }
        };
        self.take_lost_ack(key)?;
        Ok(etag)
    }

    async fn delete_row(&self, key: &str, precondition: Precondition) -> Result<()> {
        self.before_op(key, GatedOp::Write).await;
        self.take_write_fault()?;

        match self.rows.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                if !precondition.holds(Some(occupied.get().etag)) {
                    return Err(rejected(key, precondition));
                }
                occupied.remove();
                Ok(())
            }
            Entry::Vacant(_) => {
                if precondition.holds(None) {
                    Ok(())
                } else {
                    Err(rejected(key, precondition))
                }
            }
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Row)>> {
        self.before_op(prefix, GatedOp::Read).await;
        let mut rows: Vec<(String, Row)> = self
            .rows
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryRowStore::new();

        let etag = store
            .put_row("k/61", Bytes::from_static(b"Hello, World!"), Precondition::Any)
            .await
            .unwrap();

        assert!(store.has_row("k/61").await.unwrap());

        let row = store.get_row("k/61").await.unwrap();
        assert_eq!(row.as_slice(), b"Hello, World!");
        assert_eq!(row.etag, etag);
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryRowStore::new();
        let result = store.get_row("missing").await;
        assert!(matches!(result, Err(RowStoreError::NotFound(_))));
        assert!(!store.has_row("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryRowStore::new();

        let first = store
            .put_row("row", Bytes::from_static(b"one"), Precondition::Absent)
            .await
            .unwrap();

        // Second insert-if-absent must be rejected
        let err = store
            .put_row("row", Bytes::from_static(b"two"), Precondition::Absent)
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        let second = store
            .put_row("row", Bytes::from_static(b"two"), Precondition::Etag(first))
            .await
            .unwrap();
        assert_ne!(first, second);

        // Stale etag is rejected and leaves the row untouched
        let err = store
            .put_row("row", Bytes::from_static(b"three"), Precondition::Etag(first))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
        assert_eq!(store.get_row("row").await.unwrap().as_slice(), b"two");
    }

    #[tokio::test]
    async fn test_row_too_large() {
        let store = MemoryRowStore::with_max_row_size(4);
        let err = store
            .put_row("row", Bytes::from_static(b"12345"), Precondition::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, RowStoreError::RowTooLarge { size: 5, max: 4 }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_row() {
        let store = MemoryRowStore::new();
        let etag = store
            .put_row("row", Bytes::from_static(b"delete me"), Precondition::Any)
            .await
            .unwrap();

        let err = store.delete_row("row", Precondition::Etag(etag + 100)).await.unwrap_err();
        assert!(err.is_precondition_failed());

        store.delete_row("row", Precondition::Etag(etag)).await.unwrap();
        assert!(!store.has_row("row").await.unwrap());

        // Deleting a missing row unconditionally is a no-op
        store.delete_row("row", Precondition::Any).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered() {
        let store = MemoryRowStore::new();
        for key in ["p/03", "p/01", "q/01", "p/02"] {
            store
                .put_row(key, Bytes::from(key.as_bytes().to_vec()), Precondition::Any)
                .await
                .unwrap();
        }

        let rows = store.scan_prefix("p/").await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p/01", "p/02", "p/03"]);
    }

    #[tokio::test]
    async fn test_injected_write_faults() {
        let store = MemoryRowStore::new();
        store.fail_next_writes(1, RowStoreError::Timeout { seconds: 5 });

        let err = store
            .put_row("row", Bytes::from_static(b"x"), Precondition::Any)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Only one write was scheduled to fail
        store
            .put_row("row", Bytes::from_static(b"x"), Precondition::Any)
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gate_parks_first_matching_write() {
        let store = MemoryRowStore::new();
        let gate = store.hold("row", GatedOp::Write);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .put_row("row", Bytes::from_static(b"held"), Precondition::Any)
                    .await
            })
        };
        gate.reached().await;

        // Reads and other rows are unaffected while the write is parked
        assert!(!store.has_row("row").await.unwrap());
        store
            .put_row("other", Bytes::from_static(b"x"), Precondition::Any)
            .await
            .unwrap();

        gate.release();
        writer.await.unwrap().unwrap();
        assert_eq!(store.get_row("row").await.unwrap().as_slice(), b"held");

        // The gate was consumed by the first write
        store
            .put_row("row", Bytes::from_static(b"again"), Precondition::Any)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lost_ack_applies_write() {
        let store = MemoryRowStore::new();
        store.fail_ack_for("row", RowStoreError::Timeout { seconds: 2 });

        let err = store
            .put_row("row", Bytes::from_static(b"landed"), Precondition::Absent)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.get_row("row").await.unwrap().as_slice(), b"landed");
    }
}
