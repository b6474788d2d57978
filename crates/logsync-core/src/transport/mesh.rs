//! Peer mesh transport using iroh-gossip.
//!
//! A room name maps to two gossip topics, one for requests and one for
//! payloads, so peers that only serve content can ignore request chatter at
//! the topic level. The mesh has no unicast: replies are broadcast on the
//! payload topic like everything else.
//!
//! The iroh endpoint uses the node's own signing key, so a mesh endpoint id
//! is the same 32 bytes as the author's [`PeerId`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use n0_future::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent, TransportEventSender};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Keypair, PeerId};
use crate::storage::ContentStore;
use crate::wire::{self, Frame, WireFormat};

pub const MESH_TRANSPORT: &str = "mesh";

const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Rendezvous namespace shared by every peer that should sync
    pub room: String,
    /// Endpoint ids to join the topics through
    pub bootstrap: Vec<String>,
    pub max_message_size: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            room: "logsync".into(),
            bootstrap: Vec::new(),
            max_message_size: 1024 * 1024,
        }
    }
}

impl MeshConfig {
    pub fn bootstrap_ids(&self) -> SyncResult<Vec<EndpointId>> {
        self.bootstrap
            .iter()
            .map(|s| {
                s.parse::<EndpointId>()
                    .map_err(|e| SyncError::Config(format!("bad bootstrap id {}: {}", s, e)))
            })
            .collect()
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.room.is_empty() {
            return Err(SyncError::Config("mesh.room must not be empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(SyncError::Config("mesh.max_message_size must be > 0".into()));
        }
        self.bootstrap_ids().map(|_| ())
    }
}

/// The (requests, payloads) topic pair for a room.
pub fn room_topics(room: &str) -> (TopicId, TopicId) {
    let topic = |suffix: &str| {
        let digest = blake3::hash(format!("{}/{}", room, suffix).as_bytes());
        TopicId::from_bytes(*digest.as_bytes())
    };
    (topic("requests"), topic("payloads"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Requests,
    Payloads,
}

pub struct MeshTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    wire: WireFormat,
    outbound: mpsc::Sender<(Channel, Bytes)>,
    ready: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything a topic receive task needs.
struct TopicWorker {
    channel: Channel,
    topic: TopicId,
    receiver: GossipReceiver,
    events: TransportEventSender,
    outbound: mpsc::Sender<(Channel, Bytes)>,
    ready: Arc<AtomicBool>,
    store: Arc<dyn ContentStore>,
    local: PeerId,
    wire: WireFormat,
}

impl MeshTransport {
    /// Bind an endpoint, spawn gossip and join both room topics.
    pub async fn start(
        config: MeshConfig,
        keypair: &Keypair,
        wire: WireFormat,
        store: Arc<dyn ContentStore>,
        events: TransportEventSender,
        shutdown: watch::Receiver<bool>,
    ) -> SyncResult<Self> {
        let bootstrap = config.bootstrap_ids()?;
        let secret_key = SecretKey::from_bytes(&keypair.to_bytes());

        let static_provider = StaticProvider::new();
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), "Mesh endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(config.max_message_size)
            .spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        let (requests_topic, payloads_topic) = room_topics(&config.room);
        let (requests_tx, requests_rx) = gossip
            .subscribe(requests_topic, bootstrap.clone())
            .await
            .map_err(|e| SyncError::Network(format!("Failed to subscribe: {}", e)))?
            .split();
        let (payloads_tx, payloads_rx) = gossip
            .subscribe(payloads_topic, bootstrap)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to subscribe: {}", e)))?
            .split();
        info!(room = %config.room, "Mesh room joined");

        let ready = Arc::new(AtomicBool::new(true));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let local = keypair.peer_id();
        let worker = |channel, topic, receiver| TopicWorker {
            channel,
            topic,
            receiver,
            events: events.clone(),
            outbound: outbound.clone(),
            ready: Arc::clone(&ready),
            store: Arc::clone(&store),
            local,
            wire,
        };
        let tasks = vec![
            tokio::spawn(write_loop(
                requests_tx,
                payloads_tx,
                outbound_rx,
                shutdown.clone(),
            )),
            tokio::spawn(worker(Channel::Requests, requests_topic, requests_rx).run(shutdown.clone())),
            tokio::spawn(worker(Channel::Payloads, payloads_topic, payloads_rx).run(shutdown)),
        ];

        if events
            .send(TransportEvent::ConnectionState {
                transport: MESH_TRANSPORT.into(),
                ready: true,
            })
            .await
            .is_err()
        {
            debug!("Transport event receiver dropped");
        }

        Ok(Self {
            endpoint,
            router,
            static_provider,
            wire,
            outbound,
            ready,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// This node's current address, for handing to other peers.
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known without relying on DNS discovery.
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(peer = %endpoint_addr.id, "Adding mesh peer address");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        info!("Mesh transport shut down");
    }
}

impl Transport for MeshTransport {
    fn name(&self) -> &str {
        MESH_TRANSPORT
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes, _target: Option<&str>) -> SyncResult<()> {
        if !self.is_ready() {
            return Err(SyncError::Transport("mesh topics are not joined".into()));
        }
        let channel = if wire::is_request_frame(&frame, self.wire) {
            Channel::Requests
        } else {
            Channel::Payloads
        };
        self.outbound
            .try_send((channel, frame))
            .map_err(|e| SyncError::Transport(format!("mesh: {}", e)))
    }
}

async fn write_loop(
    requests: GossipSender,
    payloads: GossipSender,
    mut outbound: mpsc::Receiver<(Channel, Bytes)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some((channel, frame)) = next else { break };
                let sender = match channel {
                    Channel::Requests => &requests,
                    Channel::Payloads => &payloads,
                };
                let len = frame.len();
                if let Err(e) = sender.broadcast(frame).await {
                    warn!(?channel, error = %e, "Mesh broadcast failed");
                } else {
                    debug!(?channel, len, "Mesh broadcast");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

impl TopicWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                next = self.receiver.try_next() => match next {
                    Ok(Some(event)) => self.handle(event).await,
                    Ok(None) => {
                        debug!(topic = ?self.topic, "Topic subscription closed");
                        break;
                    }
                    Err(e) => {
                        warn!(topic = ?self.topic, error = ?e, "Error receiving from topic");
                        break;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }

        // a dead subscription means the room is no longer joined
        self.ready.store(false, Ordering::SeqCst);
        self.publish(TransportEvent::ConnectionState {
            transport: MESH_TRANSPORT.into(),
            ready: false,
        })
        .await;
    }

    async fn handle(&self, event: Event) {
        match event {
            Event::Received(msg) => {
                self.publish(TransportEvent::Received {
                    transport: MESH_TRANSPORT.into(),
                    from: Some(msg.delivered_from.to_string()),
                    bytes: msg.content,
                })
                .await;
            }
            Event::NeighborUp(peer) => {
                info!(topic = ?self.topic, %peer, "Neighbor joined");
                // one topic is enough to announce the peer and offer our head
                if self.channel == Channel::Payloads {
                    self.offer_latest();
                    self.publish(TransportEvent::PeerJoined {
                        transport: MESH_TRANSPORT.into(),
                        peer: peer.to_string(),
                    })
                    .await;
                }
            }
            Event::NeighborDown(peer) => {
                debug!(topic = ?self.topic, %peer, "Neighbor left");
            }
            Event::Lagged => {
                warn!(topic = ?self.topic, "Lagged behind on topic");
            }
        }
    }

    /// Push our latest envelope so a new neighbour learns our head.
    fn offer_latest(&self) {
        let envelope = match self.store.latest(&self.local) {
            Ok(Some(entry)) => self.store.get(&entry.hash),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        match envelope {
            Ok(Some(bytes)) => {
                let frame = wire::encode(&Frame::Payload(Bytes::from(bytes)), self.wire);
                if self.outbound.try_send((Channel::Payloads, frame)).is_err() {
                    debug!("Mesh outbound full, skipping offer");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read latest envelope for offer"),
        }
    }

    async fn publish(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}
