//! Configuration Management
//!
//! Provides functionality for:
//! - Loading the cluster peer file (JSON)
//! - Loading node tuning from an optional YAML file
//! - Configuration validation
//! - Event sink toggles from the environment

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{CoordError, Result};
use crate::protocol::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Every cluster member, self included, keyed by id.
pub type PeerMap = BTreeMap<NodeId, PeerAddress>;

/// Parse a peer file: `{"1": {"ip": "10.0.0.1", "port": 5001}, ...}`.
pub fn parse_peers(contents: &str) -> Result<PeerMap> {
    let raw: BTreeMap<String, PeerAddress> = serde_json::from_str(contents)?;
    let mut peers = PeerMap::new();
    for (key, address) in raw {
        let id: NodeId = key
            .trim()
            .parse()
            .map_err(|_| CoordError::config(format!("Invalid node id {:?} in peer file", key)))?;
        if id == 0 {
            return Err(CoordError::config("Node ids must be positive"));
        }
        if address.port == 0 {
            return Err(CoordError::config(format!("Node {} has port 0", id)));
        }
        if peers.insert(id, address).is_some() {
            return Err(CoordError::config(format!("Node {} listed twice", id)));
        }
    }
    if peers.is_empty() {
        return Err(CoordError::config("Peer file lists no nodes"));
    }
    Ok(peers)
}

pub fn load_peers(path: &Path) -> Result<PeerMap> {
    debug!("Loading peers from {}", path.display());
    let contents = fs::read_to_string(path)
        .map_err(|e| CoordError::config(format!("Failed to read peer file {}: {}", path.display(), e)))?;
    parse_peers(&contents)
}

/// Fails unless `id` is a configured member.
pub fn require_member(peers: &PeerMap, id: NodeId) -> Result<&PeerAddress> {
    peers
        .get(&id)
        .ok_or_else(|| CoordError::config(format!("Node ID {} not found in peer file", id)))
}

/// What to do when a critical-section request does not collect every reply
/// within `mutex_reply_timeout_ms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Re-send REQUEST to the peers that are alive now and have not replied.
    #[default]
    Retry,
    /// Give up immediately with `QuorumTimeout`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Coordinator heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Random extra delay added to each heartbeat period
    pub heartbeat_jitter_ms: u64,
    /// Silence from the coordinator after which a follower starts an election
    pub heartbeat_timeout_ms: u64,
    /// How long an election waits for ANSWER before self-promotion
    pub answer_timeout_ms: u64,
    /// How long to wait for COORDINATOR after an ANSWER
    pub coordinator_timeout_ms: u64,
    /// Reply wait per critical-section request round
    pub mutex_reply_timeout_ms: u64,
    pub quorum_policy: QuorumPolicy,
    pub max_quorum_retries: u32,
    /// How long `req` keeps the critical section
    pub cs_hold_ms: u64,
    pub bootstrap_delay_ms: u64,
    /// Resolution of the election deadline checks
    pub tick_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Outbound messages buffered per peer before sends are dropped
    pub send_queue_depth: usize,
    pub max_frame_length: usize,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            heartbeat_jitter_ms: 250,
            heartbeat_timeout_ms: 5000,
            answer_timeout_ms: 5000,
            coordinator_timeout_ms: 5000,
            mutex_reply_timeout_ms: 5000,
            quorum_policy: QuorumPolicy::Retry,
            max_quorum_retries: 3,
            cs_hold_ms: 3000,
            bootstrap_delay_ms: 2000,
            tick_interval_ms: 100,
            connect_timeout_ms: 2000,
            write_timeout_ms: 2000,
            reconnect_backoff_min_ms: 250,
            reconnect_backoff_max_ms: 5000,
            send_queue_depth: 256,
            max_frame_length: 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to {}", path.display());
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("Heartbeat interval", self.heartbeat_interval_ms),
            ("Answer timeout", self.answer_timeout_ms),
            ("Coordinator timeout", self.coordinator_timeout_ms),
            ("Mutex reply timeout", self.mutex_reply_timeout_ms),
            ("Tick interval", self.tick_interval_ms),
            ("Connect timeout", self.connect_timeout_ms),
            ("Write timeout", self.write_timeout_ms),
            ("Reconnect backoff", self.reconnect_backoff_min_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(CoordError::config(format!("{} cannot be zero", name)));
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CoordError::config(
                "Heartbeat timeout must be greater than heartbeat interval",
            ));
        }

        if self.reconnect_backoff_min_ms > self.reconnect_backoff_max_ms {
            return Err(CoordError::config(
                "Minimum reconnect backoff cannot exceed the maximum",
            ));
        }

        if self.send_queue_depth == 0 {
            return Err(CoordError::config("Send queue depth cannot be zero"));
        }

        if self.max_frame_length < 64 {
            return Err(CoordError::config("Max frame length is too small"));
        }

        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(CoordError::config(format!("Invalid log level {:?}", self.log_level))),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_timeout_ms)
    }

    pub fn mutex_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.mutex_reply_timeout_ms)
    }

    pub fn cs_hold(&self) -> Duration {
        Duration::from_millis(self.cs_hold_ms)
    }

    pub fn bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_backoff_min_ms),
            Duration::from_millis(self.reconnect_backoff_max_ms),
        )
    }
}

pub const DEFAULT_LOG_GROUP: &str = "Distributed_System_Logs";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Where observability events go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Ship events to the remote collector as well as printing them
    pub remote: bool,
    pub region: String,
    pub endpoint: Option<String>,
    pub log_group: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            remote: false,
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            log_group: DEFAULT_LOG_GROUP.to_string(),
        }
    }
}

impl SinkConfig {
    /// Reads `USE_CLOUDWATCH`, `AWS_REGION` and `EVENT_SINK_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let remote = lookup("USE_CLOUDWATCH")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let region = lookup("AWS_REGION")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = lookup("EVENT_SINK_ENDPOINT").filter(|v| !v.trim().is_empty());
        Self {
            remote,
            region,
            endpoint,
            log_group: DEFAULT_LOG_GROUP.to_string(),
        }
    }
}
