//! Node composition - wires discovery, registry and catalog exchange together

use super::announcer::Announcer;
use super::client::ExchangeClient;
use super::listener::DiscoveryListener;
use super::protocol::{Announcement, CatalogResponse};
use super::puller::{CatalogPuller, RetryPolicy};
use super::registry::{PeerRecord, PeerRegistry};
use super::server::ExchangeServer;
use super::P2PError;
use crate::catalog::CatalogProvider;
use crate::identity::NodeIdentifier;
use crate::ReplinkConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events emitted by a running node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer announced itself for the first time
    PeerDiscovered(PeerRecord),

    /// A peer's catalog was pulled
    CatalogReceived {
        peer: PeerRecord,
        catalog: CatalogResponse,
    },

    /// Pulling a peer's catalog failed
    PullFailed { peer: PeerRecord, error: String },

    /// Peers dropped after going quiet
    PeersExpired(Vec<PeerRecord>),
}

/// A running node
pub struct ReplinkNode {
    /// This node's identifier
    pub identifier: NodeIdentifier,

    /// Where the catalog exchange server listens
    exchange_addr: SocketAddr,

    /// Where the discovery listener listens
    discovery_addr: SocketAddr,

    /// Known peers
    registry: Arc<PeerRegistry>,

    event_rx: mpsc::UnboundedReceiver<NodeEvent>,

    /// Owns the in-flight catalog pulls
    puller: CatalogPuller,

    tasks: Vec<JoinHandle<()>>,
}

impl ReplinkNode {
    /// Start a node with a freshly generated identifier
    pub async fn start(
        config: &ReplinkConfig,
        provider: Arc<dyn CatalogProvider>,
    ) -> Result<Self, P2PError> {
        Self::start_with_identifier(config, provider, NodeIdentifier::generate()).await
    }

    /// Start a node under a given identifier.
    ///
    /// Every socket is bound before any background task is spawned, so an
    /// error here leaves nothing running.
    pub async fn start_with_identifier(
        config: &ReplinkConfig,
        provider: Arc<dyn CatalogProvider>,
        identifier: NodeIdentifier,
    ) -> Result<Self, P2PError> {
        tracing::info!("Starting node {}", identifier);

        let server = ExchangeServer::bind(
            SocketAddr::new(config.bind_address, config.exchange_port),
            identifier.clone(),
            provider,
        )
        .await?
        .with_read_timeout(config.read_timeout())
        .with_max_request_bytes(config.max_request_bytes);
        let exchange_addr = server.local_addr()?;

        let registry = Arc::new(PeerRegistry::new());
        let listener =
            DiscoveryListener::bind(config.discovery_port, identifier.clone(), registry.clone())?;
        let discovery_addr = listener.local_addr()?;

        // Announce to the port we actually listen on; differs from the
        // configured one only when that was 0
        let announcement = Announcement::new(identifier.clone(), exchange_addr.port());
        let announcer = Announcer::bind(
            &announcement,
            SocketAddr::new(config.broadcast_address, discovery_addr.port()),
        )
        .await?
        .with_interval(config.announce_interval())
        .with_retry_backoff(config.send_retry_backoff());

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = ExchangeClient::new(identifier.clone())
            .with_connect_timeout(config.connect_timeout())
            .with_read_timeout(config.read_timeout())
            .with_max_response_bytes(config.max_response_bytes);
        let puller = CatalogPuller::new(client, config.max_concurrent_pulls)
            .with_retry_policy(RetryPolicy {
                max_attempts: config.pull_attempts,
                backoff: config.pull_retry_backoff(),
            })
            .with_events(event_tx.clone());
        let listener = listener
            .with_puller(puller.clone())
            .with_events(event_tx.clone());

        let mut tasks = vec![
            tokio::spawn(server.run()),
            tokio::spawn(listener.run()),
            tokio::spawn(announcer.run()),
        ];

        if let Some(max_age) = config.peer_expiry() {
            let registry = registry.clone();
            let period = config.announce_interval();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let expired = registry.prune_stale(max_age);
                    if !expired.is_empty() {
                        for peer in &expired {
                            tracing::info!("Peer {} expired (last seen {})", peer.identifier, peer.last_seen);
                        }
                        let _ = event_tx.send(NodeEvent::PeersExpired(expired));
                    }
                }
            }));
        }

        tracing::info!(
            "Node {} running: exchange on {}, discovery on {}",
            identifier,
            exchange_addr,
            discovery_addr
        );

        Ok(Self {
            identifier,
            exchange_addr,
            discovery_addr,
            registry,
            event_rx,
            puller,
            tasks,
        })
    }

    pub fn exchange_addr(&self) -> SocketAddr {
        self.exchange_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Shared handle to the peer registry
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Snapshot of known peers
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.list()
    }

    /// Get event receiver
    pub fn event_receiver(&mut self) -> &mut mpsc::UnboundedReceiver<NodeEvent> {
        &mut self.event_rx
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.event_rx.recv().await
    }

    /// Stop every background task, including catalog pulls and open
    /// exchange connections, and wait for them to wind down
    pub async fn shutdown(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        futures::future::join_all(tasks).await;
        self.puller.shutdown().await;
        tracing::info!("Node {} stopped", self.identifier);
    }
}

impl Drop for ReplinkNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.puller.abort_all();
    }
}
