//! Configuration for controllers, storage nodes and clients.
//!
//! One [`DfsConfig`] file can describe all three roles; each process only
//! reads the section it needs. Files are JSON, durations use short
//! human-readable strings ("500ms", "5s", "1m").

use crate::error::{DfsError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::types::ComponentAddress;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes reserved in a frame for everything except chunk data.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsConfig {
    pub controller: ControllerConfig,
    pub storage: StorageNodeConfig,
    pub client: ClientConfig,
    pub connection: ConnectionConfig,
    pub observability: ObservabilityConfig,
}

impl DfsConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DfsError::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("failed to read config file: {}", e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| DfsError::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client.chunk_size == 0 {
            return Err(invalid("client.chunk_size", "chunk size must be non-zero"));
        }

        if self.client.chunk_size + FRAME_OVERHEAD > self.connection.max_frame_size {
            return Err(invalid(
                "client.chunk_size",
                "chunk size must fit in a single frame (see connection.max_frame_size)",
            ));
        }

        if self.client.parallel_downloads == 0 {
            return Err(invalid(
                "client.parallel_downloads",
                "at least one download worker is required",
            ));
        }

        if self.controller.replication_factor == 0 {
            return Err(invalid(
                "controller.replication_factor",
                "replication factor must be non-zero",
            ));
        }

        if self.controller.max_heartbeat_age <= self.storage.heartbeat_interval {
            return Err(invalid(
                "controller.max_heartbeat_age",
                "must be longer than storage.heartbeat_interval",
            ));
        }

        if self.controller.heartbeat_check_interval.is_zero() {
            return Err(invalid(
                "controller.heartbeat_check_interval",
                "check interval must be non-zero",
            ));
        }

        if self.connection.max_bad_reads == 0 || self.connection.max_errors == 0 {
            return Err(invalid(
                "connection",
                "max_bad_reads and max_errors must be non-zero",
            ));
        }

        self.storage.controller_addr.parse::<ComponentAddress>()?;

        Ok(())
    }

    /// Configuration for running every role on one machine.
    pub fn development() -> Self {
        Self {
            controller: ControllerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
                heartbeat_check_interval: Duration::from_millis(500),
                max_heartbeat_age: Duration::from_secs(3),
                replication_factor: 2,
                replication_interval: Duration::from_secs(2),
            },
            storage: StorageNodeConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
                advertise_host: "127.0.0.1".to_string(),
                controller_addr: "127.0.0.1:7000".to_string(),
                chunks_dir: PathBuf::from("/tmp/dfs/storage"),
                heartbeat_interval: Duration::from_millis(500),
            },
            client: ClientConfig {
                chunk_size: 1024 * 1024,
                parallel_downloads: 4,
                chunks_dir: PathBuf::from("/tmp/dfs/client"),
            },
            connection: ConnectionConfig::default(),
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..Default::default()
            },
        }
    }
}

fn invalid(field: &str, reason: &str) -> DfsError {
    DfsError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address to accept storage node and client connections on.
    pub bind_addr: SocketAddr,
    /// How often the heartbeat monitor scans for stale nodes.
    #[serde(with = "humantime_serde")]
    pub heartbeat_check_interval: Duration,
    /// A node silent for longer than this is declared offline.
    #[serde(with = "humantime_serde")]
    pub max_heartbeat_age: Duration,
    /// Target number of replicas per chunk.
    pub replication_factor: usize,
    /// How often the file table is swept for under-replicated chunks.
    #[serde(with = "humantime_serde")]
    pub replication_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            heartbeat_check_interval: Duration::from_secs(1),
            max_heartbeat_age: Duration::from_secs(10),
            replication_factor: 3,
            replication_interval: Duration::from_secs(5),
        }
    }
}

/// Storage node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    /// Address to accept chunk traffic on.
    pub bind_addr: SocketAddr,
    /// Host name this node reports to the controller.
    pub advertise_host: String,
    /// Controller to send heartbeats to (`host:port`).
    pub controller_addr: String,
    /// Directory holding chunk files and their checksum sidecars.
    pub chunks_dir: PathBuf,
    /// Period between heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl StorageNodeConfig {
    /// The address other components use to reach this node.
    pub fn advertise_address(&self) -> ComponentAddress {
        ComponentAddress::new(self.advertise_host.clone(), self.bind_addr.port())
    }
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7001)),
            advertise_host: "127.0.0.1".to_string(),
            controller_addr: "127.0.0.1:7000".to_string(),
            chunks_dir: PathBuf::from("/var/lib/dfs/chunks"),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Number of chunks fetched concurrently on download.
    pub parallel_downloads: usize,
    /// Scratch directory for chunk files during upload and download.
    pub chunks_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024 * 1024, // 16MB
            parallel_downloads: 4,
            chunks_dir: std::env::temp_dir().join("dfs-client"),
        }
    }
}

/// Thresholds for the per-connection health state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Consecutive empty or undecodable frames before a connection is closed.
    pub max_bad_reads: u32,
    /// Handling errors on one connection before the process gives up.
    pub max_errors: u32,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_bad_reads: 10,
            max_errors: 50,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "250ms", "5s", "2m" or a bare millisecond count.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, scale_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else {
            (s, 1)
        };

        digits
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_millis(v.saturating_mul(scale_ms)))
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    }
}
