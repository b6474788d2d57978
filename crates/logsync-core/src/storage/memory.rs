//! In-memory content store for tests and ephemeral nodes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::ContentStore;
use crate::error::SyncError;
use crate::identity::{Hash, Keypair, PeerId};
use crate::message::{AuthorLog, LogEntry};

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Hash, Vec<u8>>>,
    logs: RwLock<BTreeMap<PeerId, AuthorLog>>,
    keypair: RwLock<Option<Keypair>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs and envelopes.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}

impl ContentStore for MemoryStore {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn put(&self, key: &Hash, bytes: &[u8]) -> Result<(), SyncError> {
        self.blobs.write().insert(*key, bytes.to_vec());
        Ok(())
    }

    fn contains(&self, key: &Hash) -> Result<bool, SyncError> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn append_log(&self, author: &PeerId, entry: LogEntry) -> Result<bool, SyncError> {
        Ok(self.logs.write().entry(*author).or_default().insert(entry))
    }

    fn log(&self, author: &PeerId) -> Result<Vec<LogEntry>, SyncError> {
        Ok(self
            .logs
            .read()
            .get(author)
            .map(|log| log.entries().to_vec())
            .unwrap_or_default())
    }

    fn latest(&self, author: &PeerId) -> Result<Option<LogEntry>, SyncError> {
        Ok(self.logs.read().get(author).and_then(AuthorLog::latest))
    }

    fn authors(&self) -> Result<Vec<PeerId>, SyncError> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(peer, _)| *peer)
            .collect())
    }

    fn load_keypair(&self) -> Result<Option<Keypair>, SyncError> {
        Ok(self.keypair.read().clone())
    }

    fn save_keypair(&self, keypair: &Keypair) -> Result<(), SyncError> {
        *self.keypair.write() = Some(keypair.clone());
        Ok(())
    }
}
