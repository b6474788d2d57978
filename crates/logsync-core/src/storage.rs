//! Persistent storage using redb.
//!
//! This module provides the content store:
//! - Blobs and envelopes, addressed by hash
//! - Per-author logs of envelope hashes
//! - The local identity keypair
//!
//! The [`ContentStore`] trait is the single source of truth for "do we have
//! X". [`Storage`] is the ACID on-disk implementation, [`MemoryStore`] the
//! ephemeral one.

use crate::error::SyncError;
use crate::identity::{Hash, Keypair, PeerId};
use crate::message::{AuthorLog, LogEntry};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

mod memory;

pub use memory::MemoryStore;

// Table definitions
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

const KEYPAIR_KEY: &str = "keypair";

/// Content-addressed and author-keyed local persistence.
///
/// Absence is `Ok(None)`, never an error. Writes are idempotent.
pub trait ContentStore: Send + Sync {
    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, SyncError>;

    /// Store bytes under a key, overwriting whatever was there.
    fn put(&self, key: &Hash, bytes: &[u8]) -> Result<(), SyncError>;

    fn contains(&self, key: &Hash) -> Result<bool, SyncError> {
        Ok(self.get(key)?.is_some())
    }

    /// Add an envelope to an author's log. `false` if it was already there.
    fn append_log(&self, author: &PeerId, entry: LogEntry) -> Result<bool, SyncError>;

    /// An author's log, oldest first. Empty for unknown authors.
    fn log(&self, author: &PeerId) -> Result<Vec<LogEntry>, SyncError>;

    fn latest(&self, author: &PeerId) -> Result<Option<LogEntry>, SyncError> {
        Ok(self.log(author)?.last().copied())
    }

    /// Every author with at least one logged envelope.
    fn authors(&self) -> Result<Vec<PeerId>, SyncError>;

    fn load_keypair(&self) -> Result<Option<Keypair>, SyncError>;

    fn save_keypair(&self, keypair: &Keypair) -> Result<(), SyncError>;
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BLOBS_TABLE)?;
            let _ = write_txn.open_table(LOGS_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl ContentStore for Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Blobs
    // ═══════════════════════════════════════════════════════════════════════

    fn get(&self, key: &Hash) -> Result<Option<Vec<u8>>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        let key = key.to_base64();
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &Hash, bytes: &[u8]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            let key = key.to_base64();
            table.insert(key.as_str(), bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Author logs
    // ═══════════════════════════════════════════════════════════════════════

    fn append_log(&self, author: &PeerId, entry: LogEntry) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let appended = {
            let mut table = write_txn.open_table(LOGS_TABLE)?;
            let key = author.to_base64();
            let existing = table.get(key.as_str())?.map(|v| v.value().to_vec());
            let mut log = match existing {
                Some(bytes) => AuthorLog::from_bytes(&bytes)?,
                None => AuthorLog::new(),
            };
            if log.insert(entry) {
                table.insert(key.as_str(), log.to_bytes()?.as_slice())?;
                true
            } else {
                false
            }
        };
        if appended {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(appended)
    }

    fn log(&self, author: &PeerId) -> Result<Vec<LogEntry>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(LOGS_TABLE)?;
        let key = author.to_base64();
        match table.get(key.as_str())? {
            Some(v) => Ok(AuthorLog::from_bytes(v.value())?.into_entries()),
            None => Ok(Vec::new()),
        }
    }

    fn authors(&self) -> Result<Vec<PeerId>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(LOGS_TABLE)?;

        let mut authors = Vec::new();
        for item in table.iter()? {
            let (key, _) = item?;
            match PeerId::from_base64(key.value()) {
                Some(peer) => authors.push(peer),
                None => tracing::warn!(key = key.value(), "Skipping malformed author key"),
            }
        }
        Ok(authors)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    fn load_keypair(&self) -> Result<Option<Keypair>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(KEYPAIR_KEY)? {
            Some(v) => Ok(Some(Keypair::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    fn save_keypair(&self, keypair: &Keypair) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(KEYPAIR_KEY, keypair.to_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn entry(ts: u64, tag: &[u8]) -> LogEntry {
        LogEntry {
            timestamp: ts,
            hash: Hash::of(tag),
        }
    }

    /// Behaviour every `ContentStore` must share.
    pub(crate) fn exercise_store(store: &dyn ContentStore) {
        let author = Keypair::from_seed(&[1u8; 32]).peer_id();
        let key = Hash::of(b"blob");

        assert_eq!(store.get(&key).unwrap(), None);
        assert!(!store.contains(&key).unwrap());
        store.put(&key, b"blob").unwrap();
        store.put(&key, b"blob").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"blob".to_vec()));

        assert!(store.log(&author).unwrap().is_empty());
        assert_eq!(store.latest(&author).unwrap(), None);
        assert!(store.authors().unwrap().is_empty());

        assert!(store.append_log(&author, entry(20, b"second")).unwrap());
        assert!(store.append_log(&author, entry(10, b"first")).unwrap());
        assert!(!store.append_log(&author, entry(10, b"first")).unwrap());

        let log = store.log(&author).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].timestamp, 10);
        assert_eq!(store.latest(&author).unwrap(), Some(entry(20, b"second")));
        assert_eq!(store.authors().unwrap(), vec![author]);

        assert!(store.load_keypair().unwrap().is_none());
        let keypair = Keypair::from_seed(&[2u8; 32]);
        store.save_keypair(&keypair).unwrap();
        assert_eq!(
            store.load_keypair().unwrap().map(|k| k.peer_id()),
            Some(keypair.peer_id())
        );
    }

    #[test]
    fn test_storage_can_be_created() {
        let (_storage, _temp) = create_test_storage();
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("store.redb");
        assert!(Storage::new(&nested).is_ok());
        assert!(nested.exists());
    }

    #[test]
    fn test_storage_behaves_as_content_store() {
        let (storage, _temp) = create_test_storage();
        exercise_store(&storage);
    }

    #[test]
    fn test_logs_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("persist.redb");
        let author = Keypair::from_seed(&[4u8; 32]).peer_id();

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.put(&Hash::of(b"x"), b"x").unwrap();
            storage.append_log(&author, entry(5, b"x")).unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.get(&Hash::of(b"x")).unwrap(), Some(b"x".to_vec()));
        assert_eq!(storage.log(&author).unwrap(), vec![entry(5, b"x")]);
    }

    #[test]
    fn test_identity_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("identity.redb");
        let keypair = Keypair::generate().unwrap();

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.save_keypair(&keypair).unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        let loaded = storage.load_keypair().unwrap().expect("keypair should persist");
        assert_eq!(loaded.peer_id(), keypair.peer_id());
    }
}
