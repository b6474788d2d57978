//! Reliable link transport over TCP.
//!
//! Frames are carried with `LengthDelimitedCodec`. Each configured outbound
//! address gets a supervisor task that connects, runs the connection until
//! it drops, and reconnects with exponential [`Backoff`]. An optional
//! listener accepts inbound connections with the same framing (the remote
//! end is responsible for reconnecting those).
//!
//! ```text
//! supervisor ──connect──▶ connection task ──frames──▶ TransportEvent::Received
//!      ▲                        │
//!      └──── backoff ◀── drop ──┘
//! ```
//!
//! Every new connection is primed: the remote is asked about every author
//! we know and handed each author's latest envelope.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{Backoff, Transport, TransportEvent, TransportEventSender};
use crate::error::{SyncError, SyncResult};
use crate::storage::ContentStore;
use crate::wire::{self, Frame, WireFormat};

pub const LINK_TRANSPORT: &str = "link";

/// Outbound frames buffered per connection before sends start failing
const CONNECTION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address to accept inbound connections on, e.g. `0.0.0.0:7400`
    pub listen: Option<String>,
    /// Addresses to keep connected to
    pub connect: Vec<String>,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_frame_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen: None,
            connect: Vec::new(),
            connect_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5 * 60_000,
            max_frame_len: 8 * 1024 * 1024,
        }
    }
}

impl LinkConfig {
    pub fn is_enabled(&self) -> bool {
        self.listen.is_some() || !self.connect.is_empty()
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(SyncError::Config("link timeouts must be > 0".into()));
        }
        if self.initial_backoff_ms == 0 || self.max_backoff_ms < self.initial_backoff_ms {
            return Err(SyncError::Config(
                "link backoff needs 0 < initial_backoff_ms <= max_backoff_ms".into(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(SyncError::Config("link.max_frame_len must be > 0".into()));
        }
        Ok(())
    }
}

/// Handle to the running link transport. Cheap to clone.
#[derive(Clone)]
pub struct LinkTransport {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: LinkConfig,
    wire: WireFormat,
    store: Arc<dyn ContentStore>,
    events: TransportEventSender,
    /// Peer address -> writer channel of the live connection
    connections: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
}

impl LinkTransport {
    /// Bind the listener (if any) and start one supervisor per outbound
    /// address. Stops when `shutdown` flips to `true` or on [`close`](Self::close).
    pub async fn start(
        config: LinkConfig,
        wire: WireFormat,
        store: Arc<dyn ContentStore>,
        events: TransportEventSender,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncResult<Self> {
        let listener = match &config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match &listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (stop, _) = watch::channel(false);
        let inner = Arc::new(LinkInner {
            config,
            wire,
            store,
            events,
            connections: Mutex::new(HashMap::new()),
            stop,
            tasks: Mutex::new(Vec::new()),
            local_addr,
        });

        let mut tasks = Vec::new();

        // forward the node-wide shutdown into our own stop signal
        let forward = Arc::clone(&inner);
        tasks.push(tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            forward.stop.send_replace(true);
        }));

        if let Some(listener) = listener {
            info!(addr = ?local_addr, "Link listening");
            tasks.push(tokio::spawn(Arc::clone(&inner).accept_loop(listener)));
        }
        for addr in inner.config.connect.clone() {
            tasks.push(tokio::spawn(Arc::clone(&inner).supervise(addr)));
        }
        inner.tasks.lock().extend(tasks);

        Ok(Self { inner })
    }

    /// Address the listener is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Addresses of the live connections.
    pub fn peers(&self) -> Vec<String> {
        self.inner.connections.lock().keys().cloned().collect()
    }

    /// Stop every task and cancel pending reconnects.
    pub fn close(&self) {
        self.inner.stop.send_replace(true);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.connections.lock().clear();
        info!("Link transport closed");
    }
}

impl Transport for LinkTransport {
    fn name(&self) -> &str {
        LINK_TRANSPORT
    }

    fn is_ready(&self) -> bool {
        !self.inner.connections.lock().is_empty()
    }

    fn send(&self, frame: Bytes, target: Option<&str>) -> SyncResult<()> {
        let connections = self.inner.connections.lock();

        if let Some(addr) = target {
            match connections.get(addr) {
                Some(tx) => {
                    return tx
                        .try_send(frame)
                        .map_err(|e| SyncError::Transport(format!("link {}: {}", addr, e)));
                }
                None => {
                    // the asker reconnected or left; everyone else may still want it
                    debug!(peer = addr, "Reply target gone, sending to all connections");
                }
            }
        }

        if connections.is_empty() {
            return Err(SyncError::Transport("link has no connections".into()));
        }
        let accepted = connections
            .values()
            .filter(|tx| tx.try_send(frame.clone()).is_ok())
            .count();
        if accepted == 0 {
            return Err(SyncError::Transport("every link connection is busy".into()));
        }
        Ok(())
    }
}

impl LinkInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted link connection");
                        let inner = Arc::clone(&self);
                        let task = tokio::spawn(async move {
                            inner.run_connection(peer.to_string(), stream).await;
                        });
                        let mut tasks = self.tasks.lock();
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(task);
                    }
                    Err(e) => warn!(error = %e, "Link accept failed"),
                },
                _ = stop.changed() => break,
            }
        }
    }

    async fn supervise(self: Arc<Self>, addr: String) {
        let mut stop = self.stop.subscribe();
        let mut backoff = self.config.backoff();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        loop {
            if *stop.borrow() {
                break;
            }
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    backoff.reset();
                    Arc::clone(&self).run_connection(addr.clone(), stream).await;
                }
                Ok(Err(e)) => debug!(peer = %addr, error = %e, "Link connect failed"),
                Err(_) => debug!(peer = %addr, "Link connect timed out"),
            }

            let delay = backoff.next_delay();
            debug!(peer = %addr, delay_ms = delay.as_millis() as u64, "Link reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        debug!(peer = %addr, "Link supervisor stopped");
    }

    /// Run one connection until either side drops it.
    async fn run_connection(self: Arc<Self>, addr: String, stream: TcpStream) {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_len)
            .new_codec();
        let (mut sink, mut source) = Framed::new(stream, codec).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(CONNECTION_BUFFER);

        self.connections.lock().insert(addr.clone(), tx.clone());
        info!(peer = %addr, "Link connected");
        self.publish(TransportEvent::ConnectionState {
            transport: LINK_TRANSPORT.into(),
            ready: true,
        })
        .await;
        self.publish(TransportEvent::PeerJoined {
            transport: LINK_TRANSPORT.into(),
            peer: addr.clone(),
        })
        .await;

        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
        let writer_peer = addr.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(peer = %writer_peer, error = %e, "Link write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %writer_peer, "Link write timed out");
                        break;
                    }
                }
            }
        });

        self.prime(&addr, &tx).await;
        drop(tx);

        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(bytes)) => {
                        let event = TransportEvent::Received {
                            transport: LINK_TRANSPORT.into(),
                            from: Some(addr.clone()),
                            bytes: bytes.freeze(),
                        };
                        if self.events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(peer = %addr, error = %e, "Link read failed");
                        break;
                    }
                    None => break,
                },
                _ = &mut writer => break,
                _ = stop.changed() => break,
            }
        }

        writer.abort();
        let still_ready = {
            let mut connections = self.connections.lock();
            connections.remove(&addr);
            !connections.is_empty()
        };
        info!(peer = %addr, "Link disconnected");
        self.publish(TransportEvent::ConnectionState {
            transport: LINK_TRANSPORT.into(),
            ready: still_ready,
        })
        .await;
    }

    /// Ask about every known author and offer each one's latest envelope.
    async fn prime(&self, addr: &str, tx: &mpsc::Sender<Bytes>) {
        let authors = match self.store.authors() {
            Ok(authors) => authors,
            Err(e) => {
                warn!(error = %e, "Could not list authors for link priming");
                return;
            }
        };

        let mut frames = Vec::with_capacity(authors.len() * 2);
        for author in &authors {
            frames.push(Frame::Request(author.as_request()));
            let latest = self
                .store
                .latest(author)
                .and_then(|entry| match entry {
                    Some(entry) => self.store.get(&entry.hash),
                    None => Ok(None),
                });
            match latest {
                Ok(Some(envelope)) => frames.push(Frame::Payload(Bytes::from(envelope))),
                Ok(None) => {}
                Err(e) => warn!(author = %author, error = %e, "Could not read latest envelope"),
            }
        }

        let count = frames.len();
        for frame in frames {
            if tx.send(wire::encode(&frame, self.wire)).await.is_err() {
                return;
            }
        }
        debug!(peer = addr, authors = authors.len(), frames = count, "Link primed");
    }

    async fn publish(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}
