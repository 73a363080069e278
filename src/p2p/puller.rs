//! Catalog puller - bounded fan-out of catalog pulls to discovered peers

use super::client::ExchangeClient;
use super::node::NodeEvent;
use super::protocol::CatalogResponse;
use super::registry::PeerRecord;
use super::P2PError;
use crate::identity::NodeIdentifier;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// How often a failed pull is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per pull, including the first (1 = no retry)
    pub max_attempts: u32,

    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Runs catalog pulls as independent tasks.
///
/// At most `max_concurrent` pulls hold a connection at once, and a peer with
/// a pull already running is not pulled again until it finishes. Clones share
/// one set of pull tasks, which [`CatalogPuller::shutdown`] tears down.
#[derive(Clone)]
pub struct CatalogPuller {
    client: Arc<ExchangeClient>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<NodeIdentifier>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    policy: RetryPolicy,
    events: Option<mpsc::UnboundedSender<NodeEvent>>,
}

impl CatalogPuller {
    pub fn new(client: ExchangeClient, max_concurrent: usize) -> Self {
        Self {
            client: Arc::new(client),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            policy: RetryPolicy::default(),
            events: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Report pull results on this channel
    pub fn with_events(mut self, events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of peers with a pull queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Start a background pull of `peer`'s catalog without waiting for it.
    ///
    /// Returns `false` when a pull for the same peer is already under way.
    /// Must be called from within a tokio runtime.
    pub fn request(&self, peer: PeerRecord) -> bool {
        if !self.in_flight.lock().insert(peer.identifier.clone()) {
            tracing::debug!("Pull from peer {} already in progress", peer.identifier);
            return false;
        }

        let puller = self.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = match puller.permits.clone().acquire_owned().await {
                Ok(_permit) => puller.pull_with_retry(&peer).await,
                Err(_) => Err(P2PError::ConnectionFailed("puller shut down".into())),
            };
            puller.in_flight.lock().remove(&peer.identifier);
            puller.report(peer, result);
        });

        true
    }

    /// Abort every pull without waiting for them
    pub fn abort_all(&self) {
        self.permits.close();
        self.tasks.lock().abort_all();
    }

    /// Abort every pull and wait until their connections are dropped
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.shutdown().await;
        self.in_flight.lock().clear();
    }

    /// Pull `peer`'s catalog, retrying per the configured policy
    pub async fn pull_with_retry(&self, peer: &PeerRecord) -> Result<CatalogResponse, P2PError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.client.fetch_catalog(peer.exchange_addr()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts => {
                    tracing::debug!(
                        "Pull from peer {} failed (attempt {}/{}): {}",
                        peer.identifier,
                        attempt,
                        max_attempts,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn report(&self, peer: PeerRecord, result: Result<CatalogResponse, P2PError>) {
        let event = match result {
            Ok(catalog) => {
                tracing::info!(
                    "Retrieved file list from peer {} at {} ({} files, taken {})",
                    catalog.identifier,
                    peer.exchange_addr(),
                    catalog.files.len(),
                    catalog.timestamp.to_rfc3339()
                );
                NodeEvent::CatalogReceived { peer, catalog }
            }
            Err(e) => {
                tracing::warn!("Error requesting file list from peer {}: {}", peer.identifier, e);
                NodeEvent::PullFailed {
                    peer,
                    error: e.to_string(),
                }
            }
        };

        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FileRecord, MemoryCatalog};
    use crate::p2p::ExchangeServer;
    use chrono::Utc;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn peer_at(name: &str, addr: SocketAddr) -> PeerRecord {
        PeerRecord {
            identifier: NodeIdentifier::parse(name).unwrap(),
            address: addr.ip(),
            exchange_port: addr.port(),
            last_seen: Utc::now(),
        }
    }

    fn client() -> ExchangeClient {
        ExchangeClient::new(NodeIdentifier::parse("puller").unwrap())
    }

    async fn serve(records: Vec<FileRecord>) -> SocketAddr {
        let server = ExchangeServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            NodeIdentifier::parse("remote").unwrap(),
            Arc::new(MemoryCatalog::new(records)),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn test_request_reports_catalog() {
        let addr = serve(vec![FileRecord::directory("d", 0, Utc::now())]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let puller = CatalogPuller::new(client(), 2).with_events(tx);

        assert!(puller.request(peer_at("remote", addr)));

        match rx.recv().await.unwrap() {
            NodeEvent::CatalogReceived { peer, catalog } => {
                assert_eq!(peer.identifier.as_str(), "remote");
                assert_eq!(catalog.files.len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(puller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_skipped() {
        // A peer that accepts but never answers keeps the first pull busy
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let puller = CatalogPuller::new(client().with_read_timeout(Duration::from_secs(2)), 2);

        assert!(puller.request(peer_at("slow", addr)));
        assert!(!puller.request(peer_at("slow", addr)));
        assert_eq!(puller.in_flight(), 1);

        hold.abort();
    }

    #[tokio::test]
    async fn test_shutdown_drops_running_pull() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let puller = CatalogPuller::new(client().with_read_timeout(Duration::from_secs(60)), 2);
        assert!(puller.request(peer_at("silent", addr)));

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 1024];
        let read = stream.read(&mut buf).await.unwrap();
        assert!(read > 0);

        puller.shutdown().await;

        // Drain anything left of the request, then expect the close
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "pull connection left open after shutdown");
        assert_eq!(puller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_pull_reported() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let puller = CatalogPuller::new(client(), 1).with_events(tx);

        puller.request(peer_at("gone", addr));

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeEvent::PullFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_until_peer_appears() {
        // Reserve a port, release it, and start serving there only after a delay
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let server = ExchangeServer::bind(
                addr,
                NodeIdentifier::parse("late").unwrap(),
                Arc::new(MemoryCatalog::default()),
            )
            .await
            .unwrap();
            server.run().await;
        });

        let puller = CatalogPuller::new(client(), 1).with_retry_policy(RetryPolicy {
            max_attempts: 20,
            backoff: Duration::from_millis(50),
        });

        let response = puller.pull_with_retry(&peer_at("late", addr)).await.unwrap();
        assert_eq!(response.identifier, "late");
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let puller = CatalogPuller::new(client(), 1);

        let result = puller.pull_with_retry(&peer_at("gone", addr)).await;
        assert!(matches!(result, Err(P2PError::ConnectionFailed(_))));
    }
}
