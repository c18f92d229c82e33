//! Revisioned key-value backend

use crate::{
    config::BackendConfig,
    error::{KvError, Result},
    event::{Event, EventKind, EventSink, NoopSink},
    record::{LeaseId, Record, Revision, RevisionTriple},
    revision::{RevisionAllocator, StoredRevisionAllocator},
    store::{CommitOutcome, CompactionStats, Head, RecordStore},
    watermark::CommitWatermark,
};
use bytes::Bytes;
use revkv_rowstore::{Chunker, Precondition, RowStore};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

/// Maximum key length in bytes
pub const MAX_KEY_LEN: usize = 1536;

/// Revisioned key-value store over a row medium
///
/// Writes are compare-and-swap on the key's mod revision. The swap itself is
/// a conditional write of the key's head row, so several backends may share
/// one medium. Within a backend, writers of the same key also queue on a
/// striped lock so that events reach the sink in commit order.
///
/// Reads never look past the highest revision below which every write
/// started by this backend has finished.
pub struct Backend<S: RowStore> {
    records: RecordStore<S>,
    revisions: CommitWatermark,
    events: Arc<dyn EventSink>,
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
    config: BackendConfig,
}

impl<S: RowStore + 'static> Backend<S> {
    /// Create a backend with a medium-backed revision counter and no event sink
    pub fn new(store: Arc<S>, config: BackendConfig) -> Result<Self> {
        let allocator = Arc::new(StoredRevisionAllocator::new(
            Arc::clone(&store),
            config.allocator_max_attempts,
        ));
        Self::with_parts(store, config, allocator, Arc::new(NoopSink))
    }

    /// Create a backend from explicit collaborators
    pub fn with_parts(
        store: Arc<S>,
        config: BackendConfig,
        allocator: Arc<dyn RevisionAllocator>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate(store.max_row_size())?;
        let chunker = Chunker::with_config(config.chunker_config()?);
        let stripes = (0..config.lock_stripes).map(|_| Mutex::new(())).collect();

        Ok(Self {
            records: RecordStore::new(store, chunker),
            revisions: CommitWatermark::new(allocator),
            events,
            stripes,
            hasher: RandomState::new(),
            config,
        })
    }

    /// Replace the revision allocator
    pub fn with_allocator(mut self, allocator: Arc<dyn RevisionAllocator>) -> Self {
        self.revisions = CommitWatermark::new(allocator);
        self
    }

    /// Replace the event sink
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn stripe_index(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) as usize) % self.stripes.len()
    }

    async fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)].lock().await
    }

    async fn emit(&self, kind: EventKind, record: Record) {
        tracing::debug!(
            kind = kind.as_str(),
            revision = record.mod_revision(),
            "Emitting event"
        );
        self.events.emit(Event::new(kind, record)).await;
    }

    /// Build the conflict error for a head that failed the revision check
    async fn conflict(&self, key: &[u8], head: &Head, expected: Revision) -> KvError {
        match self.records.load(key, &head.header).await {
            Ok(current) => KvError::Conflict {
                expected,
                current: Box::new(current),
            },
            Err(e) => e,
        }
    }

    /// Re-read the head after losing a commit race
    async fn lost_race(&self, key: &[u8], expected: Revision) -> KvError {
        match self.records.head(key).await {
            Ok(Some(head)) if head.is_live() => self.conflict(key, &head, expected).await,
            Ok(_) => KvError::not_found(key),
            Err(e) => e,
        }
    }

    /// Create a key that is not currently live
    ///
    /// Returns the revision of the new record, which is both its create and
    /// mod revision. Re-inserting a deleted key starts a new lineage.
    #[instrument(skip(self, key, value), fields(key = %String::from_utf8_lossy(key)))]
    pub async fn insert(&self, key: &[u8], value: impl Into<Bytes>, lease: LeaseId) -> Result<Revision> {
        validate_key(key)?;
        let value = value.into();
        let _guard = self.lock(key).await;

        loop {
            let head = self.records.head(key).await?;
            if head.as_ref().is_some_and(Head::is_live) {
                return Err(KvError::AlreadyExists {
                    key: Bytes::copy_from_slice(key),
                });
            }
            let expected = head
                .as_ref()
                .map(Head::precondition)
                .unwrap_or(Precondition::Absent);
            let supersedes = head.map(|h| h.header.mod_revision()).unwrap_or(0);

            let pending = self.revisions.allocate().await?;
            let revision = pending.revision();
            let revisions = RevisionTriple::created(revision);
            match self
                .records
                .commit(key, &value, revisions, lease, supersedes, expected)
                .await?
            {
                CommitOutcome::Committed(_) => {
                    let record = Record::new(Bytes::copy_from_slice(key), value, revisions, lease);
                    self.emit(EventKind::Create, record).await;
                    return Ok(revision);
                }
                // Either another insert won, or the tombstone moved
                CommitOutcome::Lost => {
                    tracing::debug!(revision, "Head moved under insert, re-reading");
                }
            }
        }
    }

    /// Replace the value of a key whose mod revision equals `expected_revision`
    ///
    /// On a revision mismatch the error carries the current record, so the
    /// caller can retry against it without another read.
    #[instrument(skip(self, key, value), fields(key = %String::from_utf8_lossy(key)))]
    pub async fn update(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        expected_revision: Revision,
        lease: LeaseId,
    ) -> Result<Record> {
        validate_key(key)?;
        let value = value.into();
        let _guard = self.lock(key).await;

        let head = match self.records.head(key).await? {
            Some(head) if head.is_live() => head,
            _ => return Err(KvError::not_found(key)),
        };
        if head.header.mod_revision() != expected_revision {
            return Err(self.conflict(key, &head, expected_revision).await);
        }

        let pending = self.revisions.allocate().await?;
        let revisions = head.header.revisions.successor(pending.revision());
        match self
            .records
            .commit(
                key,
                &value,
                revisions,
                lease,
                head.header.mod_revision(),
                head.precondition(),
            )
            .await?
        {
            CommitOutcome::Committed(_) => {}
            CommitOutcome::Lost => return Err(self.lost_race(key, expected_revision).await),
        }

        let record = Record::new(Bytes::copy_from_slice(key), value, revisions, lease);
        self.emit(EventKind::Update, record.clone()).await;
        Ok(record)
    }

    /// Read a key as of a revision (0 = latest)
    ///
    /// Also returns the store's current revision at the time of the read.
    #[instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    pub async fn get(&self, key: &[u8], revision: Revision) -> Result<(Record, Revision)> {
        validate_key(key)?;
        let current = self.check_read_revision(revision).await?;
        let at = if revision == 0 { current } else { revision };
        if at == 0 {
            return Err(KvError::not_found(key));
        }

        match self.records.read(key, at).await {
            Ok(Some(record)) => Ok((record, current)),
            // Compaction may have removed what this read was resolving
            Ok(None) => {
                self.check_floor(at).await?;
                Err(KvError::not_found(key))
            }
            Err(e @ KvError::Corruption { .. }) => {
                self.check_floor(at).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a key, optionally only if its mod revision equals `expected_revision`
    ///
    /// `expected_revision` of 0 deletes unconditionally, re-reading the key
    /// if another writer replaces it first. Returns the record as it was
    /// before the delete.
    #[instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    pub async fn delete(&self, key: &[u8], expected_revision: Revision) -> Result<Record> {
        validate_key(key)?;
        let _guard = self.lock(key).await;

        loop {
            let head = match self.records.head(key).await? {
                Some(head) if head.is_live() => head,
                _ => return Err(KvError::not_found(key)),
            };
            if expected_revision != 0 && head.header.mod_revision() != expected_revision {
                return Err(self.conflict(key, &head, expected_revision).await);
            }
            let previous = self.records.load(key, &head.header).await?;

            let pending = self.revisions.allocate().await?;
            let revisions = head.header.revisions.successor(pending.revision());
            match self
                .records
                .commit_tombstone(key, revisions, head.header.lease, head.precondition())
                .await?
            {
                CommitOutcome::Committed(_) => {
                    let event = Record::new(
                        previous.key().clone(),
                        previous.value().clone(),
                        revisions,
                        previous.lease(),
                    );
                    self.emit(EventKind::Delete, event).await;
                    return Ok(previous);
                }
                CommitOutcome::Lost if expected_revision == 0 => {
                    tracing::debug!(
                        revision = pending.revision(),
                        "Head moved under unconditional delete, re-reading"
                    );
                }
                CommitOutcome::Lost => {
                    return Err(self.lost_race(key, expected_revision).await)
                }
            }
        }
    }

    /// Live records whose keys start with `prefix`, as of a revision (0 = latest)
    ///
    /// A `limit` of 0 returns every match. Also returns the current revision.
    #[instrument(skip(self, prefix), fields(prefix = %String::from_utf8_lossy(prefix)))]
    pub async fn list(
        &self,
        prefix: &[u8],
        revision: Revision,
        limit: usize,
    ) -> Result<(Vec<Record>, Revision)> {
        let current = self.check_read_revision(revision).await?;
        let at = if revision == 0 { current } else { revision };
        if at == 0 {
            return Ok((Vec::new(), current));
        }

        match self.records.list(prefix, at, limit).await {
            Ok(records) => {
                // Keys resolved after a concurrent compaction may be missing
                self.check_floor(at).await?;
                Ok((records, current))
            }
            Err(e @ KvError::Corruption { .. }) => {
                self.check_floor(at).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Highest revision whose writes, and all writes below it, have finished
    pub async fn current_revision(&self) -> Result<Revision> {
        self.revisions.readable().await
    }

    /// Drop history below `revision`
    #[instrument(skip(self))]
    pub async fn compact(&self, revision: Revision) -> Result<CompactionStats> {
        let current = self.revisions.readable().await?;
        if revision > current {
            return Err(KvError::FutureRevision {
                requested: revision,
                current,
            });
        }
        self.records.compact(revision).await
    }

    async fn check_read_revision(&self, revision: Revision) -> Result<Revision> {
        let current = self.revisions.readable().await?;
        if revision == 0 {
            return Ok(current);
        }
        if revision > current {
            return Err(KvError::FutureRevision {
                requested: revision,
                current,
            });
        }
        self.check_floor(revision).await?;
        Ok(current)
    }

    async fn check_floor(&self, revision: Revision) -> Result<()> {
        let floor = self.records.compaction_floor().await?;
        if revision < floor {
            return Err(KvError::Compacted {
                requested: revision,
                floor,
            });
        }
        Ok(())
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(KvError::InvalidKey(format!(
            "key cannot exceed {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BroadcastSink;
    use crate::revision::MemoryRevisionAllocator;
    use crate::store::{chunk_row, head_row, max_header_len};
    use revkv_rowstore::{GatedOp, MemoryRowStore, RowStoreError};

    const ROW: usize = 1024;

    fn backend() -> (Backend<MemoryRowStore>, Arc<MemoryRowStore>) {
        let medium = Arc::new(MemoryRowStore::new());
        let config = BackendConfig::default().with_max_row_size(ROW);
        (Backend::new(Arc::clone(&medium), config).unwrap(), medium)
    }

    /// A key that does not share a write lock stripe with `key`
    fn key_on_other_stripe(backend: &Backend<MemoryRowStore>, key: &[u8]) -> Vec<u8> {
        (0..)
            .map(|i| format!("/other/{}", i).into_bytes())
            .find(|other| backend.stripe_index(other) != backend.stripe_index(key))
            .unwrap()
    }

    fn value(len: usize, seed: u8) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<u8>>(),
        )
    }

    #[rstest::rstest]
    #[case::path(b"/a/b/c".to_vec(), true)]
    #[case::binary(vec![0, 255, 1], true)]
    #[case::longest(vec![b'k'; MAX_KEY_LEN], true)]
    #[case::empty(Vec::new(), false)]
    #[case::too_long(vec![b'k'; MAX_KEY_LEN + 1], false)]
    fn test_key_validation(#[case] key: Vec<u8>, #[case] valid: bool) {
        assert_eq!(validate_key(&key).is_ok(), valid);
    }

    #[tokio::test]
    async fn test_insert_sets_created_triple() {
        let (backend, _) = backend();
        let revision = backend.insert(b"/a/b/c", value(10, 1), 7).await.unwrap();

        let (record, current) = backend.get(b"/a/b/c", 0).await.unwrap();
        assert_eq!(record.create_revision(), revision);
        assert_eq!(record.mod_revision(), revision);
        assert_eq!(record.prev_revision(), 0);
        assert_eq!(record.lease(), 7);
        assert_eq!(current, revision);
    }

    #[tokio::test]
    async fn test_insert_existing_key() {
        let (backend, _) = backend();
        backend.insert(b"/k", value(3, 0), 0).await.unwrap();
        let err = backend.insert(b"/k", value(3, 1), 0).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_missing_key() {
        let (backend, _) = backend();
        let err = backend
            .update(b"idontexist", Bytes::from_static(b"someval"), 79, 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.current_record().is_none());
    }

    #[tokio::test]
    async fn test_stale_update_returns_current_record() {
        let (backend, _) = backend();
        let original = value(3 * ROW + 17, 4);
        let revision = backend.insert(b"/k", original.clone(), 1).await.unwrap();

        let err = backend
            .update(b"/k", Bytes::from_static(b"newVal"), revision + 1000, 1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = err.into_current_record().unwrap();
        assert_eq!(current.value(), &original);
        assert_eq!(current.mod_revision(), revision);

        // The failed attempt changed nothing
        assert_eq!(backend.current_revision().await.unwrap(), revision);
    }

    #[tokio::test]
    async fn test_update_chain() {
        let (backend, _) = backend();
        let r1 = backend.insert(b"/k", value(10, 0), 1).await.unwrap();

        let updated = backend.update(b"/k", value(3 * ROW, 1), r1, 1).await.unwrap();
        assert!(updated.mod_revision() > r1);
        assert_eq!(updated.create_revision(), r1);
        assert_eq!(updated.prev_revision(), r1);

        let again = backend
            .update(b"/k", value(3 * ROW, 1), updated.mod_revision(), 1)
            .await
            .unwrap();
        assert!(again.mod_revision() > updated.mod_revision());
        assert_eq!(again.create_revision(), r1);
        assert_eq!(again.prev_revision(), updated.mod_revision());
    }

    #[tokio::test]
    async fn test_delete_and_reinsert_starts_new_lineage() {
        let (backend, _) = backend();
        let r1 = backend.insert(b"/k", value(5, 0), 0).await.unwrap();
        let removed = backend.delete(b"/k", r1).await.unwrap();
        assert_eq!(removed.mod_revision(), r1);

        assert!(backend.get(b"/k", 0).await.unwrap_err().is_not_found());
        assert!(backend.delete(b"/k", 0).await.unwrap_err().is_not_found());
        assert!(backend
            .update(b"/k", value(1, 0), r1, 0)
            .await
            .unwrap_err()
            .is_not_found());

        let r3 = backend.insert(b"/k", value(5, 9), 0).await.unwrap();
        let (record, _) = backend.get(b"/k", 0).await.unwrap();
        assert_eq!(record.create_revision(), r3);
        assert_eq!(record.prev_revision(), 0);

        // History before the delete is still readable
        let (old, _) = backend.get(b"/k", r1).await.unwrap();
        assert_eq!(old.value(), &value(5, 0));
        assert!(backend.get(b"/k", r3 - 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_delete_conflict() {
        let (backend, _) = backend();
        let r1 = backend.insert(b"/k", value(5, 0), 0).await.unwrap();
        let err = backend.delete(b"/k", r1 + 5).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.current_record().unwrap().mod_revision(), r1);
        assert!(backend.get(b"/k", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_events_follow_commit_order() {
        let medium = Arc::new(MemoryRowStore::new());
        let sink = Arc::new(BroadcastSink::new(16));
        let mut rx = sink.subscribe();
        let backend = Backend::new(medium, BackendConfig::default())
            .unwrap()
            .with_allocator(Arc::new(MemoryRevisionAllocator::new()))
            .with_event_sink(sink);

        let r1 = backend.insert(b"/k", Bytes::from_static(b"a"), 0).await.unwrap();
        let r2 = backend
            .update(b"/k", Bytes::from_static(b"b"), r1, 0)
            .await
            .unwrap()
            .mod_revision();
        let r3 = backend.delete(b"/k", 0).await.unwrap();
        assert_eq!(r3.value().as_ref(), b"b");

        let create = rx.recv().await.unwrap();
        assert_eq!(create.kind, EventKind::Create);
        assert_eq!(create.revision(), r1);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, EventKind::Update);
        assert_eq!(update.revision(), r2);
        assert_eq!(update.record.value().as_ref(), b"b");

        let delete = rx.recv().await.unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert!(delete.revision() > r2);
        assert_eq!(delete.record.prev_revision(), r2);
        assert_eq!(delete.record.value().as_ref(), b"b");
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_write_leaves_record_intact() {
        let medium = Arc::new(MemoryRowStore::new());
        let config = BackendConfig::default().with_max_row_size(ROW);
        let backend = Backend::new(Arc::clone(&medium), config)
            .unwrap()
            .with_allocator(Arc::new(MemoryRevisionAllocator::new()));
        let original = value(2 * ROW + 1, 3);
        let r1 = backend.insert(b"/k", original.clone(), 0).await.unwrap();
        let rows_before = medium.len();

        // The first chunk write of the update times out
        medium.fail_next_writes(1, RowStoreError::Timeout { seconds: 1 });
        let err = backend.update(b"/k", value(4 * ROW, 8), r1, 0).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, KvError::Storage(RowStoreError::Timeout { .. })));

        assert_eq!(medium.len(), rows_before);
        let (record, _) = backend.get(b"/k", 0).await.unwrap();
        assert_eq!(record.value(), &original);
        assert_eq!(record.mod_revision(), r1);

        // Retrying with the same arguments succeeds
        let retried = backend.update(b"/k", value(4 * ROW, 8), r1, 0).await.unwrap();
        assert_eq!(retried.prev_revision(), r1);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let (backend, _) = backend();
        backend.insert(b"/a/1", Bytes::from_static(b"1"), 0).await.unwrap();
        let r2 = backend.insert(b"/a/2", Bytes::from_static(b"2"), 0).await.unwrap();
        backend.insert(b"/b/1", Bytes::from_static(b"3"), 0).await.unwrap();
        backend.insert(b"/a/3", Bytes::from_static(b"4"), 0).await.unwrap();
        backend.delete(b"/a/1", 0).await.unwrap();

        let (records, _) = backend.list(b"/a/", 0, 0).await.unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key().as_ref()).collect();
        assert_eq!(keys, vec![&b"/a/2"[..], &b"/a/3"[..]]);

        // As of r2 the first key was still live and /a/3 did not exist yet
        let (records, _) = backend.list(b"/a/", r2, 0).await.unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key().as_ref()).collect();
        assert_eq!(keys, vec![&b"/a/1"[..], &b"/a/2"[..]]);

        let (records, _) = backend.list(b"/", 0, 2).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_read_revision_bounds() {
        let (backend, _) = backend();
        let r1 = backend.insert(b"/k", value(4, 0), 0).await.unwrap();
        let r2 = backend.update(b"/k", value(4, 1), r1, 0).await.unwrap().mod_revision();
        let r3 = backend.update(b"/k", value(4, 2), r2, 0).await.unwrap().mod_revision();

        let err = backend.get(b"/k", r3 + 10).await.unwrap_err();
        assert!(matches!(err, KvError::FutureRevision { .. }));

        backend.compact(r2).await.unwrap();
        assert!(backend.get(b"/k", r1).await.unwrap_err().is_compacted());
        assert_eq!(backend.get(b"/k", r2).await.unwrap().0.value(), &value(4, 1));
        assert!(backend.compact(r3 + 1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_wait_for_lower_revisions() {
        let (backend, medium) = backend();
        let backend = Arc::new(backend);
        let other = key_on_other_stripe(&backend, b"/a");

        // The first insert takes revision 1 and stalls before its head flip
        let gate = medium.hold(head_row(b"/a"), GatedOp::Write);
        let slow = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.insert(b"/a", Bytes::from_static(b"a"), 0).await })
        };
        gate.reached().await;

        let fast = backend.insert(&other, Bytes::from_static(b"b"), 0).await.unwrap();
        assert_eq!(fast, 2);

        // Revision 2 is committed but revision 1 is not, so neither is readable
        assert_eq!(backend.current_revision().await.unwrap(), 0);
        let err = backend.get(b"/a", fast).await.unwrap_err();
        assert!(matches!(err, KvError::FutureRevision { requested: 2, current: 0 }));
        assert!(backend.get(&other, 0).await.unwrap_err().is_not_found());
        let (listed, current) = backend.list(b"/", 0, 0).await.unwrap();
        assert!(listed.is_empty());
        assert_eq!(current, 0);

        gate.release();
        assert_eq!(slow.await.unwrap().unwrap(), 1);

        assert_eq!(backend.current_revision().await.unwrap(), fast);
        assert_eq!(backend.get(b"/a", fast).await.unwrap().0.mod_revision(), 1);
        assert_eq!(backend.get(&other, fast).await.unwrap().0.mod_revision(), fast);
    }

    #[tokio::test]
    async fn test_smallest_medium_ceiling() {
        let cramped = Arc::new(MemoryRowStore::with_max_row_size(128));
        let config = BackendConfig::default().with_max_row_size(128);
        assert!(matches!(
            Backend::new(cramped, config),
            Err(KvError::Configuration(_))
        ));

        let ceiling = max_header_len().unwrap();
        let medium = Arc::new(MemoryRowStore::with_max_row_size(ceiling));
        let config = BackendConfig::default().with_max_row_size(ceiling);
        let backend = Backend::new(Arc::clone(&medium), config).unwrap();

        let original = value(3 * ceiling + 1, 6);
        let r1 = backend.insert(b"/k", original.clone(), LeaseId::MIN).await.unwrap();
        let updated = backend.update(b"/k", value(ceiling, 7), r1, -1).await.unwrap();
        assert_eq!(backend.get(b"/k", r1).await.unwrap().0.value(), &original);
        backend.delete(b"/k", updated.mod_revision()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unconditional_delete_retries_lost_flip() {
        let medium = Arc::new(MemoryRowStore::new());
        let config = BackendConfig::default().with_max_row_size(ROW);
        let left = Arc::new(Backend::new(Arc::clone(&medium), config.clone()).unwrap());
        let right = Backend::new(Arc::clone(&medium), config).unwrap();
        let r1 = left.insert(b"/k", value(10, 1), 0).await.unwrap();

        let gate = medium.hold(head_row(b"/k"), GatedOp::Write);
        let deleting = {
            let left = Arc::clone(&left);
            tokio::spawn(async move { left.delete(b"/k", 0).await })
        };
        gate.reached().await;

        // Another instance replaces the value while the delete is parked
        let newer = right.update(b"/k", value(10, 2), r1, 0).await.unwrap();
        gate.release();

        let removed = deleting.await.unwrap().unwrap();
        assert_eq!(removed.mod_revision(), newer.mod_revision());
        assert_eq!(removed.value(), &value(10, 2));
        assert!(right.get(b"/k", 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_delete_still_reports_conflict() {
        let medium = Arc::new(MemoryRowStore::new());
        let config = BackendConfig::default().with_max_row_size(ROW);
        let left = Backend::new(Arc::clone(&medium), config.clone()).unwrap();
        let right = Backend::new(Arc::clone(&medium), config).unwrap();

        let r1 = left.insert(b"/k", value(10, 1), 0).await.unwrap();
        let newer = right.update(b"/k", value(10, 2), r1, 0).await.unwrap();

        let err = left.delete(b"/k", r1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.current_record().unwrap().mod_revision(), newer.mod_revision());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_racing_compaction_reports_compacted() {
        let (backend, medium) = backend();
        let backend = Arc::new(backend);
        let r1 = backend.insert(b"/k", value(2 * ROW, 1), 0).await.unwrap();
        let r2 = backend.update(b"/k", value(10, 2), r1, 0).await.unwrap().mod_revision();
        backend.update(b"/k", value(10, 3), r2, 0).await.unwrap();

        // The read passes the floor check, then stalls on its first chunk
        let gate = medium.hold(chunk_row(b"/k", r1, 0), GatedOp::Read);
        let reader = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.get(b"/k", r1).await })
        };
        gate.reached().await;

        backend.compact(r2).await.unwrap();
        gate.release();

        let err = reader.await.unwrap().unwrap_err();
        assert!(err.is_compacted(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_applied_flip_with_lost_ack_commits() {
        let medium = Arc::new(MemoryRowStore::new());
        let sink = Arc::new(BroadcastSink::new(8));
        let mut rx = sink.subscribe();
        let backend = Backend::new(Arc::clone(&medium), BackendConfig::default())
            .unwrap()
            .with_allocator(Arc::new(MemoryRevisionAllocator::new()))
            .with_event_sink(sink);
        let r1 = backend.insert(b"/k", Bytes::from_static(b"a"), 0).await.unwrap();

        medium.fail_ack_for(head_row(b"/k"), RowStoreError::Timeout { seconds: 1 });
        let updated = backend
            .update(b"/k", Bytes::from_static(b"b"), r1, 0)
            .await
            .unwrap();
        assert_eq!(updated.prev_revision(), r1);

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Create);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, EventKind::Update);
        assert_eq!(update.revision(), updated.mod_revision());
    }

    #[tokio::test]
    async fn test_compaction_reclaims_tombstones() {
        let medium = Arc::new(MemoryRowStore::new());
        let config = BackendConfig::default().with_max_row_size(ROW);
        let backend = Backend::new(Arc::clone(&medium), config)
            .unwrap()
            .with_allocator(Arc::new(MemoryRevisionAllocator::new()));

        let r1 = backend.insert(b"/gone", value(2 * ROW + 1, 1), 0).await.unwrap();
        backend.delete(b"/gone", r1).await.unwrap();
        let kept = backend.insert(b"/kept", value(4, 2), 0).await.unwrap();

        let stats = backend.compact(kept).await.unwrap();
        assert_eq!(stats.tombstones_removed, 1);
        assert_eq!(stats.versions_removed, 1);
        assert_eq!(stats.chunks_removed, 3);

        let gone = hex::encode(b"/gone");
        assert!(medium.list_keys().iter().all(|row| !row.contains(&gone)));
        assert!(backend.get(b"/gone", 0).await.unwrap_err().is_not_found());

        let again = backend.insert(b"/gone", value(4, 3), 0).await.unwrap();
        let (record, _) = backend.get(b"/gone", 0).await.unwrap();
        assert_eq!(record.create_revision(), again);
        assert_eq!(record.prev_revision(), 0);
    }
}
