//! Configuration for minicoord nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique and stable per process)
    pub node_id: String,

    /// Role (lock, queue or cache)
    pub role: NodeRole,

    /// Bind address for the HTTP client surface
    pub bind_addr: SocketAddr,

    /// Bind address for internal gRPC
    pub grpc_addr: SocketAddr,

    /// Same-role peers, `id:host:port` (gRPC port)
    #[serde(default)]
    pub peers: Vec<String>,

    /// Data directory (raft.meta / raft.log / WAL)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Raft election timeout lower bound
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    /// Raft election timeout upper bound
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    /// Raft leader heartbeat interval
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    /// Cache line capacity per node
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Queue visibility timeout (dequeue -> redelivery)
    #[serde(default = "default_visibility_timeout")]
    pub queue_visibility_timeout_ms: u64,

    /// WAL path override (queue role); defaults to `<data_dir>/<node_id>.wal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_path: Option<PathBuf>,

    /// Virtual nodes per physical node on the hash ring
    #[serde(default = "default_virtual_nodes")]
    pub consistent_hash_virtual_nodes: usize,

    /// Peer RPC deadline
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_heartbeat() -> u64 {
    50
}
fn default_cache_capacity() -> usize {
    100
}
fn default_visibility_timeout() -> u64 {
    30_000
}
fn default_virtual_nodes() -> usize {
    150
}
fn default_rpc_timeout() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Lock,
    Queue,
    Cache,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Lock => write!(f, "lock"),
            NodeRole::Queue => write!(f, "queue"),
            NodeRole::Cache => write!(f, "cache"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "lock" => Ok(NodeRole::Lock),
            "queue" => Ok(NodeRole::Queue),
            "cache" => Ok(NodeRole::Cache),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown role: {}",
                other
            ))),
        }
    }
}

/// A parsed `id:host:port` peer entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    /// Parse `id:host:port`
    pub fn parse(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(crate::Error::InvalidConfig(format!(
                "peer must be id:host:port, got: {}",
                s
            )));
        }
        let port: u16 = parts[2]
            .parse()
            .map_err(|_| crate::Error::InvalidConfig(format!("invalid peer port: {}", parts[2])))?;
        Ok(Self {
            id: parts[0].to_string(),
            host: parts[1].to_string(),
            port,
        })
    }

    /// gRPC endpoint URL for this peer
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load from JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to JSON file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parsed peer list
    pub fn peer_addrs(&self) -> crate::Result<Vec<PeerAddr>> {
        self.peers.iter().map(|p| PeerAddr::parse(p)).collect()
    }

    /// WAL path for the queue role
    pub fn wal_file(&self) -> PathBuf {
        self.wal_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(format!("{}.wal", self.node_id)))
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_visibility_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id is required".into()));
        }

        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms >= self.election_timeout_max_ms
        {
            return Err(crate::Error::InvalidConfig(
                "election timeout range must satisfy 0 < min < max".into(),
            ));
        }

        if self.heartbeat_ms >= self.election_timeout_min_ms {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_ms must be below election_timeout_min_ms".into(),
            ));
        }

        if self.role == NodeRole::Cache && self.cache_capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "cache_capacity must be positive".into(),
            ));
        }

        let addrs = self.peer_addrs()?;
        for peer in &addrs {
            if peer.id == self.node_id {
                return Err(crate::Error::InvalidConfig(format!(
                    "peer list contains this node's own id: {}",
                    peer.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            node_id: "node-1".to_string(),
            role: NodeRole::Lock,
            bind_addr: "127.0.0.1:7000".parse().unwrap(),
            grpc_addr: "127.0.0.1:7001".parse().unwrap(),
            peers: vec![
                "node-2:localhost:7011".to_string(),
                "node-3:localhost:7021".to_string(),
            ],
            data_dir: default_data_dir(),
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_ms: default_heartbeat(),
            cache_capacity: default_cache_capacity(),
            queue_visibility_timeout_ms: default_visibility_timeout(),
            wal_path: None,
            consistent_hash_virtual_nodes: default_virtual_nodes(),
            rpc_timeout_ms: default_rpc_timeout(),
            log_level: default_log_level(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_node_id() {
        let mut config = base_config();
        config.node_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_timeouts() {
        let mut config = base_config();
        config.election_timeout_min_ms = 300;
        config.election_timeout_max_ms = 150;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.heartbeat_ms = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_parse() {
        let peer = PeerAddr::parse("node-2:localhost:7011").unwrap();
        assert_eq!(peer.id, "node-2");
        assert_eq!(peer.host, "localhost");
        assert_eq!(peer.port, 7011);
        assert_eq!(peer.endpoint(), "http://localhost:7011");

        assert!(PeerAddr::parse("node-2:localhost").is_err());
        assert!(PeerAddr::parse("node-2:localhost:abc").is_err());
    }

    #[test]
    fn test_self_in_peer_list_rejected() {
        let mut config = base_config();
        config.peers.push("node-1:localhost:7001".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wal_file_default() {
        let config = base_config();
        assert!(config.wal_file().ends_with("node-1.wal"));
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("lock".parse::<NodeRole>().unwrap(), NodeRole::Lock);
        assert_eq!("queue".parse::<NodeRole>().unwrap(), NodeRole::Queue);
        assert_eq!("cache".parse::<NodeRole>().unwrap(), NodeRole::Cache);
        assert!("volume".parse::<NodeRole>().is_err());
    }
}
