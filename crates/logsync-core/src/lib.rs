//! logsync core library
//!
//! Signed, content-addressed, append-only message logs kept eventually
//! consistent across peers over two independent transports: a reliable TCP
//! link and an iroh-gossip mesh.
//!
//! ## Overview
//!
//! - **Content store**: blobs and envelopes by hash, per-author logs ([`storage`])
//! - **Pipeline**: compose, verify, ingest, respond ([`pipeline`])
//! - **Scheduler**: hot/warm/cold tiers decide whom to ask about, and when ([`scheduler`])
//! - **Queue**: deduplicated fan-out to every registered transport ([`queue`])
//! - **Transports**: one narrow trait, several adapters ([`transport`])
//!
//! ## Quick Start
//!
//! ```ignore
//! use logsync_core::{ComposeOptions, Node, NodeConfig, NodeEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::open(NodeConfig::default())?;
//!     let mut events = node.subscribe();
//!     node.start().await?;
//!
//!     node.compose("hello", ComposeOptions::default())?;
//!
//!     while let Ok(NodeEvent::VerifiedMessage(msg)) = events.recv().await {
//!         println!("{} says {:?}", msg.author, msg.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod wire;

// Re-exports
pub use activity::{ActivityEntry, ActivityTracker};
pub use config::NodeConfig;
pub use error::{SyncError, SyncResult};
pub use identity::{hash, Hash, Keypair, PeerId};
pub use message::{ComposeOptions, ContentBlob, Envelope, LogEntry, VerifiedEnvelope};
pub use node::{Node, NodeEvent, NodeStatus};
pub use pipeline::{IngestOutcome, Pipeline, VerifiedMessage};
pub use queue::{NetworkQueue, QueueStats, Targets};
pub use scheduler::{SyncScheduler, Tier};
pub use storage::{ContentStore, MemoryStore, Storage};
pub use transport::{Transport, TransportEvent};
pub use wire::{classify, Frame, WireFormat};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
