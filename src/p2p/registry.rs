//! Peer registry - everyone we have heard announce themselves

use crate::identity::NodeIdentifier;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// A peer as last announced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer identifier (the registry key)
    pub identifier: NodeIdentifier,

    /// Address the announcement came from
    pub address: IpAddr,

    /// Port the peer serves its catalog on
    pub exchange_port: u16,

    /// Last time an announcement was seen
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// Where to connect for a catalog pull
    pub fn exchange_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.exchange_port)
    }

    /// Check if peer has not been heard from within `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Utc::now() - self.last_seen > max_age
    }
}

/// Thread-safe table of known peers, keyed by identifier.
///
/// One lock guards the whole table and is never held across an await or a
/// network call.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<NodeIdentifier, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer or refresh the existing entry in place
    pub fn upsert(&self, identifier: &NodeIdentifier, address: IpAddr, exchange_port: u16) -> PeerRecord {
        self.upsert_tracked(identifier, address, exchange_port).0
    }

    /// Same as [`upsert`](Self::upsert), also reporting whether the peer was new
    pub fn upsert_tracked(
        &self,
        identifier: &NodeIdentifier,
        address: IpAddr,
        exchange_port: u16,
    ) -> (PeerRecord, bool) {
        let now = Utc::now();
        let mut peers = self.peers.lock();

        match peers.get_mut(identifier) {
            Some(peer) => {
                peer.address = address;
                peer.exchange_port = exchange_port;
                peer.last_seen = now;
                (peer.clone(), false)
            }
            None => {
                let peer = PeerRecord {
                    identifier: identifier.clone(),
                    address,
                    exchange_port,
                    last_seen: now,
                };
                peers.insert(identifier.clone(), peer.clone());
                (peer, true)
            }
        }
    }

    /// Get peer by identifier
    pub fn get(&self, identifier: &NodeIdentifier) -> Option<PeerRecord> {
        self.peers.lock().get(identifier).cloned()
    }

    /// Snapshot of all peers, ordered by identifier
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        peers
    }

    /// Remove peers not seen within `max_age`, returning them
    pub fn prune_stale(&self, max_age: Duration) -> Vec<PeerRecord> {
        let mut peers = self.peers.lock();
        let stale: Vec<NodeIdentifier> = peers
            .values()
            .filter(|p| p.is_stale(max_age))
            .map(|p| p.identifier.clone())
            .collect();

        stale
            .iter()
            .filter_map(|identifier| peers.remove(identifier))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> NodeIdentifier {
        NodeIdentifier::parse(s).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_deduplicates() {
        let registry = PeerRegistry::new();

        let (_, is_new) = registry.upsert_tracked(&id("peer1"), ip("192.168.1.10"), 13583);
        assert!(is_new);

        let (peer, is_new) = registry.upsert_tracked(&id("peer1"), ip("192.168.1.11"), 13590);
        assert!(!is_new);

        assert_eq!(registry.len(), 1);
        assert_eq!(peer.address, ip("192.168.1.11"));
        assert_eq!(peer.exchange_port, 13590);
        assert_eq!(registry.get(&id("peer1")).unwrap(), peer);
    }

    #[test]
    fn test_same_address_distinct_identifiers() {
        let registry = PeerRegistry::new();

        registry.upsert(&id("peer1"), ip("10.0.0.5"), 13583);
        registry.upsert(&id("peer2"), ip("10.0.0.5"), 13584);

        let peers = registry.list();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].identifier, id("peer1"));
        assert_eq!(peers[1].exchange_addr(), "10.0.0.5:13584".parse().unwrap());
    }

    #[test]
    fn test_refresh_updates_last_seen() {
        let registry = PeerRegistry::new();

        let first = registry.upsert(&id("peer1"), ip("10.0.0.5"), 13583);
        std::thread::sleep(Duration::from_millis(5));
        let second = registry.upsert(&id("peer1"), ip("10.0.0.5"), 13583);

        assert!(second.last_seen > first.last_seen);
    }

    #[test]
    fn test_prune_stale() {
        let registry = PeerRegistry::new();
        registry.upsert(&id("old"), ip("10.0.0.1"), 13583);
        registry.upsert(&id("fresh"), ip("10.0.0.2"), 13583);

        registry.peers.lock().get_mut(&id("old")).unwrap().last_seen =
            Utc::now() - chrono::Duration::seconds(120);

        let pruned = registry.prune_stale(Duration::from_secs(30));

        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].identifier, id("old"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id("fresh")).is_some());
    }

    #[test]
    fn test_concurrent_upserts() {
        let registry = Arc::new(PeerRegistry::new());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.upsert(&id(&format!("peer{}", i)), ip("127.0.0.1"), 13583);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 64);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_from_tasks() {
        let registry = Arc::new(PeerRegistry::new());

        let tasks = (0..32).map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.upsert(&id(&format!("peer{}", i)), ip("127.0.0.1"), 13583 + i);
            })
        });

        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(registry.len(), 32);
    }
}
