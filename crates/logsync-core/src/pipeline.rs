//! Message pipeline: compose, verify, ingest and respond.
//!
//! Ingestion is idempotent and order independent. An envelope and its
//! content blob may arrive in either order, any number of times, over any
//! transport; the verified-message announcement happens exactly once, when
//! both halves are first present.
//!
//! Envelopes waiting for their content are indexed in memory. The index is
//! rebuilt from the stored logs on construction and capped at
//! [`MAX_WAITING_ENVELOPES`]; anything evicted stays in the log and shows up
//! again in [`Pipeline::chain_gaps`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::error::SyncResult;
use crate::identity::{Hash, Keypair, PeerId};
use crate::message::{ComposeOptions, ContentBlob, Envelope, LogEntry, VerifiedEnvelope};
use crate::storage::ContentStore;

/// A message whose envelope verified and whose content is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    pub author: PeerId,
    pub timestamp: u64,
    pub content_hash: Hash,
    pub envelope_hash: Hash,
    pub content: Bytes,
}

/// Result of [`Pipeline::compose`]. Both halves are already stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    pub envelope_hash: Hash,
    pub content_hash: Hash,
    pub timestamp: u64,
    pub envelope: Bytes,
    pub content: Bytes,
}

/// Default cap on envelopes held while their content is missing.
pub const MAX_WAITING_ENVELOPES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Envelope,
    Blob,
    /// Envelope-shaped but the signature did not check out; nothing stored
    Rejected,
}

/// What [`Pipeline::ingest`] did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub kind: PayloadKind,
    /// Hash of the payload (its storage key unless rejected)
    pub hash: Hash,
    /// Author, when the payload was a verified envelope
    pub author: Option<PeerId>,
    /// `false` when this exact payload was already known
    pub new: bool,
    /// Messages that became complete because of this payload
    pub completed: Vec<VerifiedMessage>,
    /// Hashes worth asking the network for (missing content or history)
    pub wanted: Vec<Hash>,
}

/// Envelopes that arrived before their content, oldest content hash first.
struct WaitingIndex {
    by_content: HashMap<Hash, Vec<VerifiedEnvelope>>,
    /// Insertion order of content hashes; may hold released or repeated keys
    order: VecDeque<Hash>,
    count: usize,
    limit: usize,
}

impl WaitingIndex {
    fn new(limit: usize) -> Self {
        Self {
            by_content: HashMap::new(),
            order: VecDeque::new(),
            count: 0,
            limit: limit.max(1),
        }
    }

    /// Returns how many envelopes were evicted to make room.
    fn insert(&mut self, envelope: VerifiedEnvelope) -> usize {
        let list = self.by_content.entry(envelope.content_hash).or_default();
        if list.iter().any(|e| e.hash == envelope.hash) {
            return 0;
        }
        if list.is_empty() {
            self.order.push_back(envelope.content_hash);
        }
        list.push(envelope);
        self.count += 1;
        self.shrink_to(self.limit)
    }

    fn release(&mut self, content_hash: &Hash) -> Vec<VerifiedEnvelope> {
        let released = self.by_content.remove(content_hash).unwrap_or_default();
        self.count -= released.len();
        if self.order.len() > 2 * self.by_content.len() + 64 {
            self.compact();
        }
        released
    }

    fn shrink_to(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.count > limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(list) = self.by_content.remove(&oldest) {
                self.count -= list.len();
                evicted += list.len();
            }
        }
        evicted
    }

    fn compact(&mut self) {
        let mut seen = HashSet::new();
        let by_content = &self.by_content;
        self.order
            .retain(|hash| by_content.contains_key(hash) && seen.insert(*hash));
    }
}

pub struct Pipeline {
    keypair: Keypair,
    store: Arc<dyn ContentStore>,
    activity: Arc<ActivityTracker>,
    waiting: Mutex<WaitingIndex>,
    compose_lock: Mutex<()>,
}

impl Pipeline {
    /// Build a pipeline over `store`, signing as `keypair`.
    ///
    /// Logged envelopes whose content is not stored are loaded back into the
    /// waiting index, so their content still completes them after a restart.
    /// A store error while doing so is logged and leaves the index partial.
    pub fn new(keypair: Keypair, store: Arc<dyn ContentStore>, activity: Arc<ActivityTracker>) -> Self {
        let pipeline = Self {
            keypair,
            store,
            activity,
            waiting: Mutex::new(WaitingIndex::new(MAX_WAITING_ENVELOPES)),
            compose_lock: Mutex::new(()),
        };
        match pipeline.rebuild_waiting() {
            Ok(0) => {}
            Ok(count) => info!(count, "Restored envelopes waiting for content"),
            Err(e) => warn!(error = %e, "Could not restore waiting envelopes"),
        }
        pipeline
    }

    /// Cap the waiting index at `limit` envelopes, evicting the oldest.
    pub fn with_waiting_limit(self, limit: usize) -> Self {
        {
            let mut waiting = self.waiting.lock();
            waiting.limit = limit.max(1);
            let limit = waiting.limit;
            waiting.shrink_to(limit);
        }
        self
    }

    /// Our own author identity.
    pub fn local_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Compose
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish a new message in our own log.
    ///
    /// `previous` links to our latest message, and the timestamp is forced
    /// strictly past it so our log order matches composition order.
    pub fn compose(
        &self,
        body: impl Into<String>,
        options: ComposeOptions,
        now: u64,
    ) -> SyncResult<Composed> {
        let _guard = self.compose_lock.lock();
        let author = self.keypair.peer_id();

        let latest = self.store.latest(&author)?;
        let previous = match latest {
            Some(entry) => self.content_hash_of(&entry.hash)?,
            None => None,
        };
        let timestamp = match latest {
            Some(entry) if entry.timestamp >= now => entry.timestamp + 1,
            _ => now,
        };

        let content = ContentBlob::new(body, options, previous).to_bytes()?;
        let content_hash = Hash::of(&content);
        self.store.put(&content_hash, &content)?;

        let envelope = Envelope::sign(&self.keypair, timestamp, content_hash)?.to_bytes();
        let envelope_hash = Hash::of(&envelope);
        self.store.put(&envelope_hash, &envelope)?;
        self.store.append_log(
            &author,
            LogEntry {
                timestamp,
                hash: envelope_hash,
            },
        )?;

        debug!(hash = %envelope_hash, timestamp, "Composed message");
        Ok(Composed {
            envelope_hash,
            content_hash,
            timestamp,
            envelope: Bytes::from(envelope),
            content: Bytes::from(content),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Check an envelope's signature over its raw bytes.
    pub fn verify(bytes: &[u8]) -> Option<VerifiedEnvelope> {
        Envelope::verify(bytes)
    }

    /// Store a received payload and work out what it completes or needs.
    ///
    /// A payload that parses as an envelope but fails verification is
    /// dropped without touching the store.
    pub fn ingest(&self, payload: &[u8], now: u64) -> SyncResult<IngestOutcome> {
        if let Some(envelope) = Envelope::verify(payload) {
            return self.ingest_envelope(payload, envelope, now);
        }
        if Envelope::parse(payload).is_some() {
            let hash = Hash::of(payload);
            debug!(hash = %hash, "Discarded envelope with a bad signature");
            return Ok(IngestOutcome {
                kind: PayloadKind::Rejected,
                hash,
                author: None,
                new: false,
                completed: Vec::new(),
                wanted: Vec::new(),
            });
        }
        self.ingest_blob(payload)
    }

    fn ingest_envelope(
        &self,
        bytes: &[u8],
        envelope: VerifiedEnvelope,
        now: u64,
    ) -> SyncResult<IngestOutcome> {
        self.activity.note_seen(&envelope.author, now);

        self.store.put(&envelope.hash, bytes)?;
        let new = self.store.append_log(
            &envelope.author,
            LogEntry {
                timestamp: envelope.timestamp,
                hash: envelope.hash,
            },
        )?;

        let mut completed = Vec::new();
        let mut wanted = Vec::new();
        match self.store.get(&envelope.content_hash)? {
            Some(content) if new => {
                wanted.extend(self.missing_previous(&content)?);
                completed.push(message(&envelope, content));
            }
            Some(_) => {}
            None => {
                let evicted = self.waiting.lock().insert(envelope);
                if evicted > 0 {
                    debug!(evicted, "Waiting index full, dropped oldest envelopes");
                }
                wanted.push(envelope.content_hash);
            }
        }

        debug!(
            author = %envelope.author,
            hash = %envelope.hash,
            new,
            complete = !completed.is_empty(),
            "Ingested envelope"
        );
        Ok(IngestOutcome {
            kind: PayloadKind::Envelope,
            hash: envelope.hash,
            author: Some(envelope.author),
            new,
            completed,
            wanted,
        })
    }

    fn ingest_blob(&self, bytes: &[u8]) -> SyncResult<IngestOutcome> {
        let hash = Hash::of(bytes);
        let new = !self.store.contains(&hash)?;
        self.store.put(&hash, bytes)?;

        let released = self.waiting.lock().release(&hash);
        let mut completed = Vec::with_capacity(released.len());
        let mut wanted = Vec::new();
        // keep walking the chain back as predecessors arrive
        if new || !released.is_empty() {
            wanted.extend(self.missing_previous(bytes)?);
        }
        for envelope in released {
            completed.push(message(&envelope, bytes.to_vec()));
        }

        debug!(hash = %hash, new, released = completed.len(), "Ingested blob");
        Ok(IngestOutcome {
            kind: PayloadKind::Blob,
            hash,
            author: None,
            new,
            completed,
            wanted,
        })
    }

    /// Bytes to answer a request with, if we have any.
    ///
    /// A stored hash answers with its bytes; a peer identity with a
    /// non-empty log answers with that author's latest envelope.
    pub fn respond(&self, request: &Hash) -> SyncResult<Option<Bytes>> {
        if let Some(bytes) = self.store.get(request)? {
            return Ok(Some(Bytes::from(bytes)));
        }
        let Some(peer) = PeerId::from_request(request) else {
            return Ok(None);
        };
        match self.store.latest(&peer)? {
            Some(entry) => Ok(self.store.get(&entry.hash)?.map(Bytes::from)),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════

    /// Content hashes an author's log needs but the store lacks: content of
    /// logged envelopes, and targets of `previous` links.
    pub fn chain_gaps(&self, author: &PeerId) -> SyncResult<Vec<Hash>> {
        let mut gaps = Vec::new();
        for entry in self.store.log(author)? {
            let Some(content_hash) = self.content_hash_of(&entry.hash)? else {
                continue;
            };
            let missing = match self.store.get(&content_hash)? {
                Some(content) => self.missing_previous(&content)?,
                None => Some(content_hash),
            };
            if let Some(hash) = missing {
                if !gaps.contains(&hash) {
                    gaps.push(hash);
                }
            }
        }
        Ok(gaps)
    }

    /// Envelopes still waiting for their content.
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().count
    }

    fn rebuild_waiting(&self) -> SyncResult<usize> {
        let mut restored = 0;
        for author in self.store.authors()? {
            for entry in self.store.log(&author)? {
                let Some(bytes) = self.store.get(&entry.hash)? else {
                    continue;
                };
                let Some(parsed) = Envelope::parse(&bytes) else {
                    continue;
                };
                if self.store.contains(&parsed.content_hash)? {
                    continue;
                }
                if let Some(envelope) = Envelope::verify(&bytes) {
                    self.waiting.lock().insert(envelope);
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }

    fn content_hash_of(&self, envelope_hash: &Hash) -> SyncResult<Option<Hash>> {
        Ok(self
            .store
            .get(envelope_hash)?
            .and_then(|bytes| Envelope::parse(&bytes))
            .map(|e| e.content_hash))
    }

    fn missing_previous(&self, content: &[u8]) -> SyncResult<Option<Hash>> {
        match ContentBlob::parse(content).and_then(|blob| blob.previous) {
            Some(previous) if !self.store.contains(&previous)? => Ok(Some(previous)),
            _ => Ok(None),
        }
    }
}

fn message(envelope: &VerifiedEnvelope, content: Vec<u8>) -> VerifiedMessage {
    VerifiedMessage {
        author: envelope.author,
        timestamp: envelope.timestamp,
        content_hash: envelope.content_hash,
        envelope_hash: envelope.hash,
        content: Bytes::from(content),
    }
}
