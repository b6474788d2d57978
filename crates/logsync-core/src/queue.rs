//! Network queue: deduplicated, multi-transport outbound delivery.
//!
//! Items wait here until every transport they target has accepted them, or
//! until the thing they ask for shows up from somewhere. Requests for the
//! same hash collapse into one item whose target set is the union of every
//! enqueue. `Targets::All` is resolved against the registered transports at
//! drain time, so a transport that is registered but down keeps the item
//! alive until it comes up. A fresh `Targets::All` enqueue for a pending
//! request re-arms it on every transport.
//!
//! The queue holds at most `max_items` items. Past that the oldest payload
//! is evicted first, then the oldest request.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::Hash;
use crate::transport::Transport;
use crate::wire::{self, Frame, WireFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pause between drains while items are pending
    pub drain_interval_ms: u64,
    /// Pending items kept before the oldest are evicted
    pub max_items: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 100,
            max_items: 4096,
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.drain_interval_ms == 0 {
            return Err(SyncError::Config("queue.drain_interval_ms must be > 0".into()));
        }
        if self.max_items == 0 {
            return Err(SyncError::Config("queue.max_items must be > 0".into()));
        }
        Ok(())
    }
}

/// Which transports an item should go out on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every registered transport, resolved at drain time
    All,
    Only(BTreeSet<String>),
}

impl Targets {
    /// A single named transport.
    pub fn only(name: impl Into<String>) -> Self {
        Targets::Only(BTreeSet::from([name.into()]))
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            Targets::All => true,
            Targets::Only(names) => names.contains(name),
        }
    }
}

/// Counters for status display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub enqueued: u64,
    /// Enqueues folded into an existing item
    pub merged: u64,
    /// Items dropped because what they asked for arrived
    pub satisfied: u64,
    /// Items dropped to stay under `max_items`
    pub evicted: u64,
    /// Accepted sends per transport
    pub sent: HashMap<String, u64>,
}

struct QueueItem {
    frame: Frame,
    encoded: Bytes,
    targets: Targets,
    sent: HashSet<String>,
    reply_to: Option<String>,
}

impl QueueItem {
    /// Fold another enqueue of the same request into this item.
    fn merge(&mut self, targets: Targets) {
        match targets {
            // asking everyone again means sending everywhere again
            Targets::All => {
                self.targets = Targets::All;
                self.sent.clear();
            }
            Targets::Only(theirs) => {
                if let Targets::Only(mine) = &mut self.targets {
                    for name in theirs {
                        if mine.insert(name.clone()) {
                            self.sent.remove(&name);
                        }
                    }
                }
            }
        }
    }

    fn is_complete(&self, registered: &[String]) -> bool {
        match &self.targets {
            // nothing registered yet: keep waiting
            Targets::All => {
                !registered.is_empty() && registered.iter().all(|n| self.sent.contains(n))
            }
            Targets::Only(names) => names.iter().all(|n| self.sent.contains(n)),
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<u64, QueueItem>,
    by_key: HashMap<Hash, u64>,
    next_id: u64,
    stats: QueueStats,
}

impl QueueState {
    fn remove(&mut self, id: u64) {
        if let Some(item) = self.items.remove(&id) {
            if let Some(key) = item.frame.dedup_key() {
                self.by_key.remove(&key);
            }
        }
    }

    /// Drop items until at most `limit` remain, never touching `keep`.
    fn evict_overflow(&mut self, limit: usize, keep: u64) -> usize {
        let mut evicted = 0;
        while self.items.len() > limit {
            let candidates = || self.items.iter().filter(|&(&id, _)| id != keep);
            let victim = candidates()
                .find(|(_, item)| !item.frame.is_request())
                .or_else(|| candidates().next())
                .map(|(&id, _)| id);
            let Some(id) = victim else { break };
            self.remove(id);
            evicted += 1;
        }
        self.stats.evicted += evicted as u64;
        evicted
    }
}

/// One transport send the drain decided to make.
struct Dispatch {
    id: u64,
    transport: Arc<dyn Transport>,
    frame: Bytes,
    reply_to: Option<String>,
}

pub struct NetworkQueue {
    config: QueueConfig,
    wire: WireFormat,
    state: Mutex<QueueState>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    wake: Notify,
}

impl NetworkQueue {
    pub fn new(config: QueueConfig, wire: WireFormat) -> Self {
        Self {
            config,
            wire,
            state: Mutex::new(QueueState::default()),
            transports: RwLock::new(Vec::new()),
            wake: Notify::new(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport registry
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a transport, replacing any with the same name.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.write();
        transports.retain(|t| t.name() != transport.name());
        info!(transport = transport.name(), "Transport registered");
        transports.push(transport);
        drop(transports);
        self.wake.notify_one();
    }

    /// Pending items keep their sent marks for a transport that comes back.
    pub fn unregister(&self, name: &str) {
        self.transports.write().retain(|t| t.name() != name);
    }

    /// `false` for unknown transports.
    pub fn transport_ready(&self, name: &str) -> bool {
        self.transports
            .read()
            .iter()
            .any(|t| t.name() == name && t.is_ready())
    }

    pub fn transport_names(&self) -> Vec<String> {
        self.transports.read().iter().map(|t| t.name().to_string()).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Enqueue / cancel
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a frame. Returns `false` when it was merged into a pending item.
    ///
    /// Merging unions the targets. Names newly added to an `Only` set get
    /// sent; an incoming `All` clears every sent mark.
    pub fn enqueue(&self, frame: Frame, targets: Targets, reply_to: Option<String>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.stats.enqueued += 1;

        if let Some(key) = frame.dedup_key() {
            if let Some(item) = state.by_key.get(&key).and_then(|id| state.items.get_mut(id)) {
                item.merge(targets);
                state.stats.merged += 1;
                debug!(hash = %key, "Merged request into pending item");
                return false;
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        if let Some(key) = frame.dedup_key() {
            state.by_key.insert(key, id);
        }
        let encoded = wire::encode(&frame, self.wire);
        state.items.insert(
            id,
            QueueItem {
                frame,
                encoded,
                targets,
                sent: HashSet::new(),
                reply_to,
            },
        );
        let evicted = state.evict_overflow(self.config.max_items, id);
        drop(guard);
        if evicted > 0 {
            warn!(evicted, limit = self.config.max_items, "Queue full, evicted oldest items");
        }

        self.wake.notify_one();
        true
    }

    /// Ask every transport for a hash. A pending request for the same hash is
    /// re-armed on every transport.
    pub fn enqueue_request(&self, hash: Hash) -> bool {
        self.enqueue(Frame::Request(hash), Targets::All, None)
    }

    /// Whatever `key` asked for has arrived; stop asking.
    pub fn note_received(&self, key: &Hash) -> bool {
        let mut state = self.state.lock();
        match state.by_key.get(key).copied() {
            Some(id) => {
                state.remove(id);
                state.stats.satisfied += 1;
                debug!(hash = %key, "Pending request satisfied");
                true
            }
            None => false,
        }
    }

    /// Whether a request for `key` is still queued.
    pub fn is_pending(&self, key: &Hash) -> bool {
        self.state.lock().by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Counters plus the current number of pending items.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.pending = state.items.len();
        stats
    }

    /// Nudge the drain task, e.g. when a transport becomes ready.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drain
    // ═══════════════════════════════════════════════════════════════════════

    /// One pass over every pending item. Returns the number of accepted sends.
    ///
    /// Transports are called without the queue lock held.
    pub fn drain_once(&self) -> usize {
        let transports: Vec<Arc<dyn Transport>> = self.transports.read().clone();
        let registered: Vec<String> = transports.iter().map(|t| t.name().to_string()).collect();

        let plan: Vec<Dispatch> = {
            let state = self.state.lock();
            state
                .items
                .iter()
                .flat_map(|(&id, item)| {
                    transports
                        .iter()
                        .filter(|t| item.targets.includes(t.name()))
                        .filter(|t| !item.sent.contains(t.name()))
                        .filter(|t| t.is_ready())
                        .map(move |t| Dispatch {
                            id,
                            transport: Arc::clone(t),
                            frame: item.encoded.clone(),
                            reply_to: item.reply_to.clone(),
                        })
                })
                .collect()
        };

        let mut delivered = Vec::with_capacity(plan.len());
        for dispatch in plan {
            let name = dispatch.transport.name().to_string();
            match dispatch
                .transport
                .send(dispatch.frame, dispatch.reply_to.as_deref())
            {
                Ok(()) => delivered.push((dispatch.id, name)),
                Err(e) => debug!(transport = %name, error = %e, "Send failed, will retry"),
            }
        }

        let accepted = delivered.len();
        let mut state = self.state.lock();
        for (id, name) in delivered {
            if let Some(item) = state.items.get_mut(&id) {
                item.sent.insert(name.clone());
            }
            *state.stats.sent.entry(name).or_default() += 1;
        }
        let complete: Vec<u64> = state
            .items
            .iter()
            .filter(|(_, item)| item.is_complete(&registered))
            .map(|(&id, _)| id)
            .collect();
        for id in complete {
            state.remove(id);
        }
        accepted
    }

    /// Spawn the drain task.
    ///
    /// Parks while the queue is empty, otherwise drains every
    /// `drain_interval` until shutdown is signalled.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let interval = queue.config.drain_interval();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if queue.is_empty() {
                    tokio::select! {
                        _ = queue.wake.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let sent = queue.drain_once();
                if sent > 0 {
                    debug!(sent, pending = queue.len(), "Queue drained");
                }
            }
            debug!("Queue drain task stopped");
        })
    }
}
