//! Transport adapters.
//!
//! A transport is anything that can push an encoded frame towards peers and
//! report whether it currently can. Transports never call back into the
//! node: everything they observe is published as a [`TransportEvent`] on an
//! mpsc channel that the node's router task drains.
//!
//! ## Implementations
//!
//! - [`LinkTransport`] (`"link"`): supervised TCP connections with
//!   length-delimited framing, reconnecting with exponential backoff
//! - [`MeshTransport`] (`"mesh"`): iroh-gossip topics derived from a room name
//! - [`MemoryTransport`]: in-process channel pair, for tests and simulations

mod backoff;
mod link;
mod memory;
mod mesh;

pub use backoff::Backoff;
pub use link::{LinkConfig, LinkTransport, LINK_TRANSPORT};
pub use memory::MemoryTransport;
pub use mesh::{room_topics, MeshConfig, MeshTransport, MESH_TRANSPORT};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SyncResult;

/// Capacity of the channel carrying transport events to the node.
pub const TRANSPORT_EVENT_CAPACITY: usize = 1024;

/// Sending half handed to every transport.
pub type TransportEventSender = mpsc::Sender<TransportEvent>;

/// The narrow contract the network queue relies on.
pub trait Transport: Send + Sync {
    /// Stable name used for targeting (`"link"`, `"mesh"`, ...)
    fn name(&self) -> &str;

    /// Whether a `send` right now has a chance of succeeding
    fn is_ready(&self) -> bool;

    /// Hand an encoded frame to the transport's writer.
    ///
    /// Must not block. `target` addresses one peer when the transport can
    /// (a reply); `None` means everyone reachable. An error leaves the frame
    /// queued for the next drain.
    fn send(&self, frame: Bytes, target: Option<&str>) -> SyncResult<()>;
}

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame arrived. `from` is a transport-specific reply address.
    Received {
        transport: String,
        from: Option<String>,
        bytes: Bytes,
    },
    /// The transport's readiness changed
    ConnectionState { transport: String, ready: bool },
    /// A new peer became reachable
    PeerJoined { transport: String, peer: String },
}
