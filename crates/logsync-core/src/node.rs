//! The node: every component wired together.
//!
//! ```text
//!  transports ──TransportEvent──▶ router task ──▶ pipeline (ingest / respond)
//!      ▲                              │
//!      │                              ├──▶ queue (replies, wanted hashes)
//!  queue drain task ◀── scheduler     └──▶ NodeEvent broadcast
//! ```
//!
//! All background tasks share one `watch` shutdown signal. Nothing here owns
//! global state: two nodes can live in the same process, which is how the
//! scenario tests run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::config::NodeConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Hash, Keypair, PeerId};
use crate::message::ComposeOptions;
use crate::pipeline::{PayloadKind, Pipeline, VerifiedMessage};
use crate::queue::{NetworkQueue, QueueStats, Targets};
use crate::scheduler::{SyncScheduler, TierCounts};
use crate::storage::{ContentStore, Storage};
use crate::transport::{
    LinkTransport, MeshTransport, Transport, TransportEvent, TransportEventSender,
    TRANSPORT_EVENT_CAPACITY,
};
use crate::wire::{self, Frame, WireFormat};

/// How long shutdown waits for each background task.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What the node tells its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A verified envelope and its content are both stored, for the first time
    VerifiedMessage(VerifiedMessage),
    TransportState { transport: String, ready: bool },
    PeerJoined { transport: String, peer: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub name: String,
    pub ready: bool,
}

/// Snapshot for status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub transports: Vec<TransportStatus>,
    pub known_peers: usize,
    pub tiers: TierCounts,
    pub queue: QueueStats,
    /// Envelopes whose content has not arrived yet
    pub waiting_for_content: usize,
}

pub struct Node {
    config: NodeConfig,
    keypair: Keypair,
    store: Arc<dyn ContentStore>,
    activity: Arc<ActivityTracker>,
    pipeline: Arc<Pipeline>,
    queue: Arc<NetworkQueue>,
    scheduler: Arc<SyncScheduler>,
    event_tx: broadcast::Sender<NodeEvent>,
    transport_tx: TransportEventSender,
    transport_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    link: Mutex<Option<LinkTransport>>,
    mesh: Mutex<Option<Arc<MeshTransport>>>,
}

impl Node {
    /// Open (or create) the on-disk store under `config.data_dir`.
    pub fn open(config: NodeConfig) -> SyncResult<Self> {
        let storage = Storage::new(config.database_path())?;
        Self::with_store(config, Arc::new(storage))
    }

    /// Build a node over any store. The keypair is loaded from the store, or
    /// generated and saved on first use.
    pub fn with_store(config: NodeConfig, store: Arc<dyn ContentStore>) -> SyncResult<Self> {
        config.validate()?;

        let keypair = match store.load_keypair()? {
            Some(keypair) => keypair,
            None => {
                let keypair = Keypair::generate()?;
                store.save_keypair(&keypair)?;
                info!(peer_id = %keypair.peer_id(), "Generated new identity");
                keypair
            }
        };

        let activity = Arc::new(ActivityTracker::new());
        let pipeline = Arc::new(Pipeline::new(
            keypair.clone(),
            Arc::clone(&store),
            Arc::clone(&activity),
        ));
        let queue = Arc::new(NetworkQueue::new(config.queue.clone(), config.wire_format));
        let scheduler = Arc::new(SyncScheduler::new(
            config.scheduler.clone(),
            keypair.peer_id(),
            Arc::clone(&store),
            Arc::clone(&activity),
            Arc::clone(&queue),
        ));

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            keypair,
            store,
            activity,
            pipeline,
            queue,
            scheduler,
            event_tx,
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            mesh: Mutex::new(None),
        })
    }

    /// Spawn the router, queue drain and scheduler tasks, and start the
    /// configured transports. Can only be called once.
    pub async fn start(&self) -> SyncResult<()> {
        let transport_rx = self
            .transport_rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::Config("node already started".into()))?;

        let router = EventRouter {
            wire: self.config.wire_format,
            pipeline: Arc::clone(&self.pipeline),
            queue: Arc::clone(&self.queue),
            scheduler: Arc::clone(&self.scheduler),
            events: self.event_tx.clone(),
        };
        let mut tasks = vec![
            tokio::spawn(router.run(transport_rx, self.shutdown_tx.subscribe())),
            self.queue.spawn(self.shutdown_tx.subscribe()),
            self.scheduler.spawn(self.shutdown_tx.subscribe()),
        ];

        if self.config.link.is_enabled() {
            let link = LinkTransport::start(
                self.config.link.clone(),
                self.config.wire_format,
                Arc::clone(&self.store),
                self.transport_tx.clone(),
                self.shutdown_tx.subscribe(),
            )
            .await?;
            self.queue.register(Arc::new(link.clone()));
            *self.link.lock() = Some(link);
        }

        if let Some(mesh_config) = &self.config.mesh {
            let mesh = Arc::new(
                MeshTransport::start(
                    mesh_config.clone(),
                    &self.keypair,
                    self.config.wire_format,
                    Arc::clone(&self.store),
                    self.transport_tx.clone(),
                    self.shutdown_tx.subscribe(),
                )
                .await?,
            );
            self.queue.register(mesh.clone());
            *self.mesh.lock() = Some(mesh);
        }

        self.tasks.lock().append(&mut tasks);
        info!(
            peer_id = %self.peer_id(),
            transports = ?self.queue.transport_names(),
            "Node started"
        );
        Ok(())
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(&self) {
        info!("Shutting down node");
        self.shutdown_tx.send_replace(true);

        let link = self.link.lock().take();
        if let Some(link) = link {
            link.close();
        }
        let mesh = self.mesh.lock().take();
        if let Some(mesh) = mesh {
            mesh.shutdown().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Node shut down");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transports
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a transport beyond the configured ones.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.queue.register(transport);
    }

    /// Channel a custom transport publishes its events on.
    pub fn transport_events(&self) -> TransportEventSender {
        self.transport_tx.clone()
    }

    /// `false` for unknown transports.
    pub fn transport_ready(&self, name: &str) -> bool {
        self.queue.transport_ready(name)
    }

    /// Where the link transport listens, if it does.
    pub fn link_addr(&self) -> Option<SocketAddr> {
        self.link.lock().as_ref().and_then(LinkTransport::local_addr)
    }

    /// The mesh transport, once `start` has joined it.
    pub fn mesh(&self) -> Option<Arc<MeshTransport>> {
        self.mesh.lock().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborator surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Identity this node signs as.
    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// Receive [`NodeEvent`]s. Slow subscribers miss events rather than
    /// blocking ingestion.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Publish a message and hand it to every transport. Returns the
    /// envelope hash.
    pub fn compose(&self, body: impl Into<String>, options: ComposeOptions) -> SyncResult<Hash> {
        let composed = self.pipeline.compose(body, options, crate::now_millis())?;
        self.queue
            .enqueue(Frame::Payload(composed.envelope), Targets::All, None);
        self.queue
            .enqueue(Frame::Payload(composed.content), Targets::All, None);
        Ok(composed.envelope_hash)
    }

    /// The user is looking at this peer: schedule it as hot.
    pub fn note_interest(&self, peer: &PeerId) {
        self.activity.note_interest(peer, crate::now_millis());
        self.scheduler.track(peer);
    }

    /// Ask for a peer's latest envelope now, skipping its tier interval.
    pub fn request_sync(&self, peer: &PeerId) {
        self.scheduler.request_sync(peer, crate::now_millis());
    }

    /// Ask the network for history missing from an author's chain.
    pub fn backfill(&self, author: &PeerId) -> SyncResult<usize> {
        let gaps = self.pipeline.chain_gaps(author)?;
        for hash in &gaps {
            self.queue.enqueue_request(*hash);
        }
        Ok(gaps.len())
    }

    /// Snapshot of transports, scheduling and queue state.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            peer_id: self.peer_id(),
            transports: self
                .queue
                .transport_names()
                .into_iter()
                .map(|name| TransportStatus {
                    ready: self.queue.transport_ready(&name),
                    name,
                })
                .collect(),
            known_peers: self.scheduler.known_count(),
            tiers: self.scheduler.tier_counts(crate::now_millis()),
            queue: self.queue.stats(),
            waiting_for_content: self.pipeline.waiting_count(),
        }
    }
}

/// Turns transport events into pipeline calls, queue work and node events.
struct EventRouter {
    wire: WireFormat,
    pipeline: Arc<Pipeline>,
    queue: Arc<NetworkQueue>,
    scheduler: Arc<SyncScheduler>,
    events: broadcast::Sender<NodeEvent>,
}

impl EventRouter {
    async fn run(
        self,
        mut rx: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Event router stopped");
    }

    fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Received {
                transport,
                from,
                bytes,
            } => match wire::decode(&bytes, self.wire) {
                Some(Frame::Request(hash)) => self.answer(hash, transport, from),
                Some(Frame::Payload(payload)) => self.ingest(&payload),
                None => debug!(%transport, len = bytes.len(), "Dropping undecodable frame"),
            },
            TransportEvent::ConnectionState { transport, ready } => {
                info!(%transport, ready, "Transport state changed");
                if ready {
                    self.queue.wake();
                }
                self.emit(NodeEvent::TransportState { transport, ready });
            }
            TransportEvent::PeerJoined { transport, peer } => {
                debug!(%transport, %peer, "Peer joined");
                self.emit(NodeEvent::PeerJoined { transport, peer });
            }
        }
    }

    fn answer(&self, hash: Hash, transport: String, from: Option<String>) {
        match self.pipeline.respond(&hash) {
            Ok(Some(bytes)) => {
                debug!(%hash, %transport, "Answering request");
                self.queue
                    .enqueue(Frame::Payload(bytes), Targets::only(transport), from);
            }
            Ok(None) => {}
            Err(e) => warn!(%hash, error = %e, "Could not answer request"),
        }
    }

    fn ingest(&self, payload: &[u8]) {
        let outcome = match self.pipeline.ingest(payload, crate::now_millis()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Could not ingest payload");
                return;
            }
        };

        if outcome.kind == PayloadKind::Rejected {
            return;
        }
        self.queue.note_received(&outcome.hash);
        if let Some(author) = outcome.author {
            // any envelope by this author answers a request for their head
            self.queue.note_received(&author.as_request());
            self.scheduler.track(&author);
        }
        for hash in outcome.wanted {
            self.queue.enqueue_request(hash);
        }
        for message in outcome.completed {
            debug!(author = %message.author, hash = %message.envelope_hash, "Verified message");
            self.emit(NodeEvent::VerifiedMessage(message));
        }
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
