//! Record storage over a row medium
//!
//! Row layout, with keys hex encoded so byte order and prefixes survive:
//!
//! ```text
//! h/{key}                    head row: header of the current version
//! v/{key}/{rev}              history row: header of the version committed at rev
//! c/{key}/{rev}/{index}      chunk rows of the value committed at rev
//! m/revision                 revision counter
//! m/compact                  compaction floor
//! ```
//!
//! A write stages its chunk and history rows under its own revision and then
//! replaces the head row with an etag-guarded put. That put is the commit
//! point: readers always start from the head row, so staged rows of a write
//! that has not committed (or lost its race) are never reachable.

use crate::error::{KvError, Result};
use crate::record::{LeaseId, Record, RecordHeader, Revision, RevisionTriple};
use bytes::Bytes;
use futures::future::try_join_all;
use revkv_rowstore::{ChunkManifest, Chunker, Etag, Precondition, RowStore, RowStoreError, CHECKSUM_HEX_LEN};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Row holding the compaction floor
pub const COMPACTION_FLOOR_ROW: &str = "m/compact";

const HEAD_PREFIX: &str = "h/";

pub(crate) fn head_row(key: &[u8]) -> String {
    format!("{}{}", HEAD_PREFIX, hex::encode(key))
}

fn version_prefix(key: &[u8]) -> String {
    format!("v/{}/", hex::encode(key))
}

fn version_row(key: &[u8], revision: Revision) -> String {
    format!("v/{}/{:020}", hex::encode(key), revision)
}

fn chunk_prefix(key: &[u8], revision: Revision) -> String {
    format!("c/{}/{:020}/", hex::encode(key), revision)
}

pub(crate) fn chunk_row(key: &[u8], revision: Revision, index: usize) -> String {
    format!("c/{}/{:020}/{:08}", hex::encode(key), revision, index)
}

fn key_from_head_row(row_key: &str) -> Result<Bytes> {
    let encoded = row_key.strip_prefix(HEAD_PREFIX).unwrap_or(row_key);
    hex::decode(encoded)
        .map(Bytes::from)
        .map_err(|e| KvError::Storage(RowStoreError::InvalidRowKey(format!("{}: {}", row_key, e))))
}

fn encode_header(header: &RecordHeader) -> Result<Bytes> {
    serde_json::to_vec(header)
        .map(Bytes::from)
        .map_err(|e| KvError::Storage(e.into()))
}

fn decode_header(key: &[u8], data: &[u8]) -> Result<RecordHeader> {
    serde_json::from_slice(data).map_err(|e| KvError::corruption(key, format!("header: {}", e)))
}

/// Size of the widest header a head or history row can hold
pub fn max_header_len() -> Result<usize> {
    let widest = RecordHeader {
        revisions: RevisionTriple {
            create: Revision::MAX,
            modified: Revision::MAX,
            prev: Revision::MAX,
        },
        lease: LeaseId::MIN,
        supersedes: Revision::MAX,
        tombstone: false,
        manifest: Some(ChunkManifest {
            chunk_count: usize::MAX,
            total_size: u64::MAX,
            checksum: "f".repeat(CHECKSUM_HEX_LEN),
        }),
    };
    Ok(encode_header(&widest)?.len())
}

fn encode_revision(revision: Revision) -> Bytes {
    Bytes::copy_from_slice(&revision.to_be_bytes())
}

/// The head row of a key
#[derive(Clone, Debug)]
pub struct Head {
    pub header: RecordHeader,
    pub etag: Etag,
}

impl Head {
    /// Precondition that only holds while this head is still current
    pub fn precondition(&self) -> Precondition {
        Precondition::Etag(self.etag)
    }

    pub fn is_live(&self) -> bool {
        self.header.is_live()
    }
}

/// Result of attempting to commit a version
#[derive(Clone, Debug)]
pub enum CommitOutcome {
    /// The head now points at the new version
    Committed(RecordHeader),
    /// Another writer replaced the head first; staged rows were discarded
    Lost,
}

/// Rows removed by a compaction pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub keys_scanned: usize,
    pub versions_removed: usize,
    pub chunks_removed: usize,
    /// Deleted keys whose tombstone fell under the floor
    pub tombstones_removed: usize,
}

/// Maps logical records onto head, history and chunk rows
pub struct RecordStore<S: RowStore> {
    store: Arc<S>,
    chunker: Chunker,
}

impl<S: RowStore> RecordStore<S> {
    /// Create a record store over a medium
    pub fn new(store: Arc<S>, chunker: Chunker) -> Self {
        Self { store, chunker }
    }

    /// Read the head row of a key
    pub async fn head(&self, key: &[u8]) -> Result<Option<Head>> {
        match self.store.get_row(&head_row(key)).await {
            Ok(row) => Ok(Some(Head {
                header: decode_header(key, &row.data)?,
                etag: row.etag,
            })),
            Err(RowStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Revisions of the live version of a key, without reading its value
    pub async fn current_revisions(&self, key: &[u8]) -> Result<Option<RevisionTriple>> {
        Ok(self
            .head(key)
            .await?
            .filter(Head::is_live)
            .map(|head| head.header.revisions))
    }

    /// Read and reassemble the value a header points at
    pub async fn load(&self, key: &[u8], header: &RecordHeader) -> Result<Record> {
        let manifest = header
            .manifest
            .as_ref()
            .ok_or_else(|| KvError::corruption(key, "tombstone carries no value"))?;
        let revision = header.mod_revision();

        let reads = (0..manifest.chunk_count).map(|index| {
            let row_key = chunk_row(key, revision, index);
            async move {
                match self.store.get_row(&row_key).await {
                    Ok(row) => Ok(row.data),
                    Err(RowStoreError::NotFound(_)) => Err(KvError::corruption(
                        key,
                        format!("missing chunk {} of revision {}", index, revision),
                    )),
                    Err(e) => Err(KvError::from(e)),
                }
            }
        });
        let chunks = try_join_all(reads).await?;

        let value = self
            .chunker
            .decode(&chunks, manifest)
            .map_err(|e| KvError::corruption(key, e.to_string()))?;
        Ok(Record::new(
            Bytes::copy_from_slice(key),
            value,
            header.revisions,
            header.lease,
        ))
    }

    /// Read a key as of a revision (0 = latest)
    ///
    /// Returns the newest version whose mod revision is at or below
    /// `revision`, or `None` if that version is missing or a tombstone.
    #[instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    pub async fn read(&self, key: &[u8], revision: Revision) -> Result<Option<Record>> {
        let Some(head) = self.head(key).await? else {
            return Ok(None);
        };
        let Some(header) = self.resolve(key, head.header, revision).await? else {
            return Ok(None);
        };
        if !header.is_live() {
            return Ok(None);
        }
        self.load(key, &header).await.map(Some)
    }

    async fn resolve(
        &self,
        key: &[u8],
        head: RecordHeader,
        revision: Revision,
    ) -> Result<Option<RecordHeader>> {
        if revision == 0 || head.mod_revision() <= revision {
            return Ok(Some(head));
        }

        let history = self.history(key).await?;
        let mut cursor = head.supersedes;
        while cursor != 0 {
            let Some(header) = history.get(&cursor) else {
                // Compacted away
                return Ok(None);
            };
            if header.mod_revision() <= revision {
                return Ok(Some(header.clone()));
            }
            cursor = header.supersedes;
        }
        Ok(None)
    }

    /// All history rows of a key, committed or not, by revision
    async fn history(&self, key: &[u8]) -> Result<HashMap<Revision, RecordHeader>> {
        let prefix = version_prefix(key);
        let rows = self.store.scan_prefix(&prefix).await?;

        let mut history = HashMap::with_capacity(rows.len());
        for (row_key, row) in rows {
            let revision: Revision = row_key[prefix.len()..].parse().map_err(|_| {
                KvError::Storage(RowStoreError::InvalidRowKey(row_key.clone()))
            })?;
            history.insert(revision, decode_header(key, &row.data)?);
        }
        Ok(history)
    }

    /// Stage a value under its revision and flip the head row to it
    #[instrument(skip(self, key, value), fields(key = %String::from_utf8_lossy(key), revision = revisions.modified, size = value.len()))]
    pub async fn commit(
        &self,
        key: &[u8],
        value: &Bytes,
        revisions: RevisionTriple,
        lease: LeaseId,
        supersedes: Revision,
        expected: Precondition,
    ) -> Result<CommitOutcome> {
        let revision = revisions.modified;
        let encoded = self.chunker.encode(value);
        let header = RecordHeader::live(revisions, lease, supersedes, encoded.manifest);

        let writes = encoded.chunks.into_iter().enumerate().map(|(index, chunk)| {
            let row_key = chunk_row(key, revision, index);
            async move {
                self.store
                    .put_row(&row_key, chunk, Precondition::Absent)
                    .await
                    .map_err(KvError::from)
            }
        });
        if let Err(e) = try_join_all(writes).await {
            self.discard(key, revision).await;
            return Err(e);
        }

        self.stage_and_flip(key, header, expected).await
    }

    /// Stage a deletion marker and flip the head row to it
    #[instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key), revision = revisions.modified))]
    pub async fn commit_tombstone(
        &self,
        key: &[u8],
        revisions: RevisionTriple,
        lease: LeaseId,
        expected: Precondition,
    ) -> Result<CommitOutcome> {
        self.stage_and_flip(key, RecordHeader::tombstone(revisions, lease), expected)
            .await
    }

    async fn stage_and_flip(
        &self,
        key: &[u8],
        header: RecordHeader,
        expected: Precondition,
    ) -> Result<CommitOutcome> {
        let revision = header.mod_revision();
        let data = encode_header(&header)?;

        if let Err(e) = self
            .store
            .put_row(&version_row(key, revision), data.clone(), Precondition::Absent)
            .await
        {
            self.discard(key, revision).await;
            return Err(e.into());
        }

        match self.store.put_row(&head_row(key), data, expected).await {
            Ok(_) => Ok(CommitOutcome::Committed(header)),
            Err(e) if e.is_precondition_failed() => {
                tracing::debug!(revision, "Head moved before commit, discarding staged rows");
                self.discard(key, revision).await;
                Ok(CommitOutcome::Lost)
            }
            // The flip may or may not have been applied, so staged rows stay.
            Err(e) => match self.head(key).await {
                Ok(Some(head)) if head.header.mod_revision() == revision => {
                    tracing::warn!(revision, error = %e, "Head flip reported failure but was applied");
                    Ok(CommitOutcome::Committed(header))
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Remove the chunk and history rows of one revision, best effort
    async fn discard(&self, key: &[u8], revision: Revision) {
        if let Err(e) = self.remove_version(key, revision).await {
            tracing::warn!(
                key = %String::from_utf8_lossy(key),
                revision,
                error = %e,
                "Failed to discard staged rows"
            );
        }
    }

    /// Delete the chunk rows and history row of a revision, returning the chunk count
    async fn remove_version(&self, key: &[u8], revision: Revision) -> Result<usize> {
        let chunks = self.store.scan_prefix(&chunk_prefix(key, revision)).await?;
        let removed = chunks.len();
        try_join_all(
            chunks
                .iter()
                .map(|(row_key, _)| self.store.delete_row(row_key, Precondition::Any)),
        )
        .await?;
        self.store
            .delete_row(&version_row(key, revision), Precondition::Any)
            .await?;
        Ok(removed)
    }

    /// Live records under a key prefix as of a revision (0 = latest), in key order
    #[instrument(skip(self, prefix), fields(prefix = %String::from_utf8_lossy(prefix)))]
    pub async fn list(&self, prefix: &[u8], revision: Revision, limit: usize) -> Result<Vec<Record>> {
        let rows = self.store.scan_prefix(&head_row(prefix)).await?;

        let mut records = Vec::new();
        for (row_key, row) in rows {
            if limit > 0 && records.len() >= limit {
                break;
            }
            let key = key_from_head_row(&row_key)?;
            let head = decode_header(&key, &row.data)?;
            let Some(header) = self.resolve(&key, head, revision).await? else {
                continue;
            };
            if header.is_live() {
                records.push(self.load(&key, &header).await?);
            }
        }
        Ok(records)
    }

    /// Lowest revision that can still be read (0 if never compacted)
    pub async fn compaction_floor(&self) -> Result<Revision> {
        Ok(self.floor_row().await?.map(|(floor, _)| floor).unwrap_or(0))
    }

    async fn floor_row(&self) -> Result<Option<(Revision, Etag)>> {
        match self.store.get_row(COMPACTION_FLOOR_ROW).await {
            Ok(row) => {
                let bytes: [u8; 8] = row.as_slice().try_into().map_err(|_| {
                    KvError::Storage(RowStoreError::Deserialization(format!(
                        "compaction floor row holds {} bytes",
                        row.size()
                    )))
                })?;
                Ok(Some((u64::from_be_bytes(bytes), row.etag)))
            }
            Err(RowStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Raise the compaction floor and drop history no longer reachable at or above it
    ///
    /// For every key the newest version at or below `floor` is kept so reads
    /// at the floor still resolve; everything older on its chain is removed.
    /// A key whose head is a tombstone at or below the floor is removed
    /// entirely.
    #[instrument(skip(self))]
    pub async fn compact(&self, floor: Revision) -> Result<CompactionStats> {
        let (current, precondition) = match self.floor_row().await? {
            Some((current, etag)) => (current, Precondition::Etag(etag)),
            None => (0, Precondition::Absent),
        };
        if floor <= current {
            return Err(KvError::Compacted {
                requested: floor,
                floor: current,
            });
        }

        // Raise the floor first so no reader resolves rows being removed.
        match self
            .store
            .put_row(COMPACTION_FLOOR_ROW, encode_revision(floor), precondition)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_precondition_failed() => {
                let current = self.compaction_floor().await?;
                return Err(KvError::Compacted {
                    requested: floor,
                    floor: current,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let mut stats = CompactionStats::default();
        for (row_key, row) in self.store.scan_prefix(HEAD_PREFIX).await? {
            let key = key_from_head_row(&row_key)?;
            let head = decode_header(&key, &row.data)?;
            stats.keys_scanned += 1;

            let history = self.history(&key).await?;
            let mut kept = head.mod_revision() <= floor;
            let mut cursor = head.supersedes;
            while cursor != 0 {
                let Some(header) = history.get(&cursor) else {
                    break;
                };
                if kept {
                    stats.chunks_removed += self.remove_version(&key, cursor).await?;
                    stats.versions_removed += 1;
                } else if header.mod_revision() <= floor {
                    kept = true;
                }
                cursor = header.supersedes;
            }

            if !head.is_live() && head.mod_revision() <= floor {
                // Guarded so a concurrent re-insert keeps the head it replaces
                match self
                    .store
                    .delete_row(&row_key, Precondition::Etag(row.etag))
                    .await
                {
                    Ok(()) => {
                        stats.chunks_removed += self.remove_version(&key, head.mod_revision()).await?;
                        stats.tombstones_removed += 1;
                    }
                    Err(e) if e.is_precondition_failed() => {
                        tracing::debug!(revision = head.mod_revision(), "Tombstone replaced during compaction");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tracing::debug!(
            floor,
            keys = stats.keys_scanned,
            versions = stats.versions_removed,
            tombstones = stats.tombstones_removed,
            "Compaction finished"
        );
        Ok(stats)
    }
}
