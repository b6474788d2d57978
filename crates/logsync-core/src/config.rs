//! Node configuration.
//!
//! Every section has a `Default` carrying the reference values and is
//! `#[serde(default)]`, so a config file only needs the keys it changes.
//! Durations are stored as milliseconds.
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/logsync",
//!   "link": { "listen": "0.0.0.0:7400", "connect": ["10.0.0.2:7400"] },
//!   "mesh": { "room": "garden" }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::logging::LoggingConfig;
use crate::queue::QueueConfig;
use crate::scheduler::SchedulerConfig;
use crate::transport::{LinkConfig, MeshConfig};
use crate::wire::WireFormat;

/// File name of the redb database inside `data_dir`.
pub const DATABASE_FILE: &str = "logsync.redb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub wire_format: WireFormat,
    /// Capacity of the verified-message broadcast channel
    pub event_capacity: usize,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub link: LinkConfig,
    /// `None` leaves the mesh transport off
    pub mesh: Option<MeshConfig>,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wire_format: WireFormat::default(),
            event_capacity: 256,
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            link: LinkConfig::default(),
            mesh: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be > 0".into()));
        }
        self.scheduler.validate()?;
        self.queue.validate()?;
        self.link.validate()?;
        if let Some(mesh) = &self.mesh {
            mesh.validate()?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("logsync"))
        .unwrap_or_else(|| PathBuf::from(".logsync"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wire_format, WireFormat::Tagged);
        assert_eq!(config.queue.drain_interval_ms, 100);
        assert_eq!(config.scheduler.hot.batch, 4);
        assert_eq!(config.link.max_backoff_ms, 300_000);
        assert!(config.mesh.is_none());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("node.json");
        std::fs::write(
            &path,
            r#"{ "wire_format": "legacy", "link": { "connect": ["127.0.0.1:7400"] }, "mesh": { "room": "garden" } }"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.wire_format, WireFormat::Legacy);
        assert_eq!(config.link.connect, vec!["127.0.0.1:7400".to_string()]);
        assert_eq!(config.link.connect_timeout_ms, 10_000);
        assert_eq!(config.mesh.as_ref().unwrap().room, "garden");
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("node.json");
        std::fs::write(&path, r#"{ "queue": { "drain_interval_ms": 0 } }"#).unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("node.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            NodeConfig::load("/definitely/not/here.json"),
            Err(SyncError::Io(_))
        ));
    }
}
