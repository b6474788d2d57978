//! logsync node host
//!
//! Loads a config, starts a [`Node`] and keeps it running until Ctrl+C.
//!
//! ```bash
//! logsync-node --listen 0.0.0.0:7400 --connect 10.0.0.2:7400 --room garden -v
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use logsync_core::logging::init_logging;
use logsync_core::transport::MeshConfig;
use logsync_core::{ContentBlob, Node, NodeConfig, NodeEvent, PeerId, WireFormat};
use tokio::sync::broadcast::error::RecvError;

/// Signed append-only logs, synchronized peer to peer
#[derive(Parser)]
#[command(name = "logsync-node")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Accept link connections on this address
    #[arg(long)]
    listen: Option<String>,

    /// Keep a link connection to this address (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Join the gossip mesh under this room name
    #[arg(long)]
    room: Option<String>,

    /// Mesh bootstrap endpoint id (repeatable)
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Send untagged frames, for peers that predate tagging
    #[arg(long)]
    legacy_wire: bool,

    /// Peer to treat as interesting from the start (repeatable)
    #[arg(long)]
    follow: Vec<String>,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.verbose > 0 {
            config.logging.filter = match self.verbose {
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
            .to_string();
        }
        if self.listen.is_some() {
            config.link.listen = self.listen.clone();
        }
        config.link.connect.extend(self.connect.iter().cloned());
        if self.room.is_some() || !self.bootstrap.is_empty() {
            let mesh = config.mesh.get_or_insert_with(MeshConfig::default);
            if let Some(room) = &self.room {
                mesh.room = room.clone();
            }
            mesh.bootstrap.extend(self.bootstrap.iter().cloned());
        }
        if self.legacy_wire {
            config.wire_format = WireFormat::Legacy;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn followed(&self) -> Result<Vec<PeerId>> {
        self.follow
            .iter()
            .map(|s| PeerId::from_base64(s).ok_or_else(|| anyhow!("invalid peer id: {}", s)))
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.node_config()?;
    let followed = cli.followed()?;
    init_logging(&config.logging)?;

    let data_dir = config.data_dir.clone();
    let node = Node::open(config)?;
    let mut events = node.subscribe();
    node.start().await?;
    for peer in &followed {
        node.note_interest(peer);
    }

    println!("logsync-node v{}", env!("CARGO_PKG_VERSION"));
    println!("  Peer ID: {}", node.peer_id());
    println!("  Data directory: {}", data_dir.display());
    if let Some(addr) = node.link_addr() {
        println!("  Link listening on {}", addr);
    }
    if let Some(mesh) = node.mesh() {
        println!("  Mesh endpoint: {}", mesh.endpoint_id());
    }
    println!();
    println!("Node is running. Press Ctrl+C to stop.");

    let mut status_tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(NodeEvent::VerifiedMessage(message)) => {
                    let body = ContentBlob::parse(&message.content)
                        .map(|blob| blob.body)
                        .unwrap_or_default();
                    println!("[{}] {}", message.author, body);
                }
                Ok(NodeEvent::PeerJoined { transport, peer }) => {
                    println!("[{}] peer joined: {}", transport, peer);
                }
                Ok(NodeEvent::TransportState { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = status_tick.tick() => {
                let status = node.status();
                println!(
                    "[Status] {} peer(s) ({} hot, {} warm, {} cold), {} queued, transports {}",
                    status.known_peers,
                    status.tiers.hot,
                    status.tiers.warm,
                    status.tiers.cold,
                    status.queue.pending,
                    serde_json::to_string(&status.transports)?,
                );
            }
        }
    }

    println!("Shutting down...");
    node.shutdown().await;
    println!("Goodbye.");
    Ok(())
}
