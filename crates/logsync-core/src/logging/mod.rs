//! Logging setup.
//!
//! Console output goes through `tracing_subscriber::fmt`. Optionally every
//! event is also appended as one JSON object per line to a per-node file,
//! so several nodes running side by side never write to the same file:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-18_alice.jsonl
//!     └── 2026-10-18_bob.jsonl
//! ```
//!
//! ```bash
//! # every warning from any node, in time order
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.level == "warn")'
//! ```

mod entry;
mod layer;
mod writer;

pub use entry::LogRecord;
pub use layer::JsonlLayer;
pub use writer::{read_records, JsonlWriter};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    pub filter: String,
    /// Directory for JSONL logs; `None` disables them
    pub logs_dir: Option<PathBuf>,
    /// Name used in JSONL records and file names
    pub node_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            logs_dir: None,
            node_name: "node".into(),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> SyncResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| SyncError::Config(format!("bad log filter {:?}: {}", config.filter, e)))?;

    let jsonl = match &config.logs_dir {
        Some(dir) => Some(JsonlLayer::new(dir, &config.node_name)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialized: {}", e)))
}
