//! Record and revision types

use bytes::Bytes;
use revkv_rowstore::ChunkManifest;
use serde::{Deserialize, Serialize};

/// Global logical timestamp assigned to every successful mutation.
///
/// Revision 0 is never allocated; it means "no predecessor" in a
/// [`RevisionTriple`] and "latest" when passed to a read.
pub type Revision = u64;

/// Opaque lease handle attached to a record
pub type LeaseId = i64;

/// The revisions describing one version of a record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionTriple {
    /// Revision at which the current lineage of the key was created
    pub create: Revision,
    /// Revision of the mutation that produced this version
    pub modified: Revision,
    /// Mod revision this version superseded (0 for a fresh insert)
    pub prev: Revision,
}

impl RevisionTriple {
    /// Triple for a freshly inserted key
    pub const fn created(revision: Revision) -> Self {
        Self {
            create: revision,
            modified: revision,
            prev: 0,
        }
    }

    /// Triple for a new version replacing `self` at `revision`
    pub const fn successor(&self, revision: Revision) -> Self {
        Self {
            create: self.create,
            modified: revision,
            prev: self.modified,
        }
    }
}

impl std::fmt::Display for RevisionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "create:{} mod:{} prev:{}",
            self.create, self.modified, self.prev
        )
    }
}

/// A key with its value at one revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    key: Bytes,
    value: Bytes,
    revisions: RevisionTriple,
    lease: LeaseId,
}

impl Record {
    /// Create a new record
    pub fn new(key: Bytes, value: Bytes, revisions: RevisionTriple, lease: LeaseId) -> Self {
        Self {
            key,
            value,
            revisions,
            lease,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn create_revision(&self) -> Revision {
        self.revisions.create
    }

    pub fn mod_revision(&self) -> Revision {
        self.revisions.modified
    }

    pub fn prev_revision(&self) -> Revision {
        self.revisions.prev
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Get the full revision triple
    pub fn revisions(&self) -> RevisionTriple {
        self.revisions
    }

    /// Consume the record and return its value
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Header persisted in head and history rows
///
/// The value itself lives in chunk rows addressed by `revisions.modified`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Revisions of this version
    pub revisions: RevisionTriple,
    /// Lease attached to this version
    pub lease: LeaseId,
    /// Mod revision of the head this version replaced, tombstones included
    #[serde(default)]
    pub supersedes: Revision,
    /// Whether this version is a deletion marker
    #[serde(default)]
    pub tombstone: bool,
    /// Chunk layout of the value (absent for tombstones)
    pub manifest: Option<ChunkManifest>,
}

impl RecordHeader {
    /// Header for a version carrying a value
    pub fn live(revisions: RevisionTriple, lease: LeaseId, supersedes: Revision, manifest: ChunkManifest) -> Self {
        Self {
            revisions,
            lease,
            supersedes,
            tombstone: false,
            manifest: Some(manifest),
        }
    }

    /// Header for a deletion marker
    pub fn tombstone(revisions: RevisionTriple, lease: LeaseId) -> Self {
        Self {
            revisions,
            lease,
            supersedes: revisions.prev,
            tombstone: true,
            manifest: None,
        }
    }

    /// Whether the header describes a live value
    pub fn is_live(&self) -> bool {
        !self.tombstone
    }

    pub fn mod_revision(&self) -> Revision {
        self.revisions.modified
    }
}
