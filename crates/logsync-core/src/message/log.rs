//! Per-author logs of envelope hashes.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::Hash;

/// One envelope in an author's log.
///
/// Field order matters: entries sort by timestamp, then hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    /// Envelope hash
    pub hash: Hash,
}

/// Ordered, duplicate-free list of an author's envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorLog {
    entries: Vec<LogEntry>,
}

impl AuthorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping order. Returns `false` if the hash is already present.
    pub fn insert(&mut self, entry: LogEntry) -> bool {
        if self.contains(&entry.hash) {
            return false;
        }
        let pos = self.entries.partition_point(|e| e < &entry);
        self.entries.insert(pos, entry);
        true
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.iter().any(|e| &e.hash == hash)
    }

    pub fn latest(&self) -> Option<LogEntry> {
        self.entries.last().copied()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}
