//! Replink Core - LAN peer discovery and file catalog exchange
//!
//! Nodes on the same local network find each other through a periodic UDP
//! broadcast and pull one another's file catalogs over a short TCP exchange.
//! This is the groundwork for replication: after discovery every node knows
//! which files each peer holds.

pub mod catalog;
pub mod identity;
pub mod p2p;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Replink operations
#[derive(Error, Debug)]
pub enum ReplinkError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),

    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("P2P network error: {0}")]
    P2P(#[from] p2p::P2PError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplinkError>;

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReplinkConfig {
    /// UDP port every node listens on for announcements
    pub discovery_port: u16,

    /// TCP port this node serves its catalog on
    pub exchange_port: u16,

    /// Local address the exchange server binds to
    pub bind_address: IpAddr,

    /// Destination of our announcements
    pub broadcast_address: IpAddr,

    /// Time between announcements
    pub announce_interval_ms: u64,

    /// Pause after a failed announcement send
    pub send_retry_backoff_ms: u64,

    /// Connect timeout for catalog pulls
    pub connect_timeout_ms: u64,

    /// Read deadline on exchange connections, both directions
    pub read_timeout_ms: u64,

    /// Catalog pulls allowed to run at once
    pub max_concurrent_pulls: usize,

    /// Attempts per catalog pull (1 = no retry)
    pub pull_attempts: u32,

    /// Pause between pull attempts
    pub pull_retry_backoff_ms: u64,

    /// Forget peers not heard from for this long (None = keep forever)
    pub peer_expiry_secs: Option<u64>,

    /// Largest catalog request accepted by the server
    pub max_request_bytes: usize,

    /// Largest catalog response accepted by the client
    pub max_response_bytes: usize,
}

impl Default for ReplinkConfig {
    fn default() -> Self {
        Self {
            discovery_port: p2p::DISCOVERY_PORT,
            exchange_port: p2p::DEFAULT_EXCHANGE_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval_ms: 5_000,
            send_retry_backoff_ms: 5_000,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            max_concurrent_pulls: 8,
            pull_attempts: 1,
            pull_retry_backoff_ms: 1_000,
            peer_expiry_secs: None,
            max_request_bytes: 64 * 1024,
            max_response_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ReplinkConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ReplinkError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.announce_interval_ms == 0 {
            return Err(ReplinkError::Config("announce_interval_ms must be positive".into()));
        }
        if self.max_concurrent_pulls == 0 {
            return Err(ReplinkError::Config("max_concurrent_pulls must be positive".into()));
        }
        if self.pull_attempts == 0 {
            return Err(ReplinkError::Config("pull_attempts must be at least 1".into()));
        }
        if !self.broadcast_address.is_ipv4() {
            return Err(ReplinkError::Config(format!(
                "broadcast_address {} is not an IPv4 address",
                self.broadcast_address
            )));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn send_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.send_retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn pull_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_retry_backoff_ms)
    }

    pub fn peer_expiry(&self) -> Option<Duration> {
        self.peer_expiry_secs.map(Duration::from_secs)
    }
}
