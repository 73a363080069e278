//! Discovery listener - turns announcements into registry entries and pulls

use super::node::NodeEvent;
use super::protocol::{Announcement, AnnouncementError, MAX_DATAGRAM_BYTES};
use super::puller::CatalogPuller;
use super::registry::{PeerRecord, PeerRegistry};
use super::P2PError;
use crate::identity::NodeIdentifier;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// What became of one received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// A foreign peer announced itself and was registered
    Discovered(PeerRecord),

    /// Our own announcement came back to us
    OwnAnnouncement,

    /// Not a usable announcement
    Discarded(AnnouncementError),
}

/// Receives announcements on the shared discovery port
pub struct DiscoveryListener {
    socket: UdpSocket,
    own_identifier: NodeIdentifier,
    registry: Arc<PeerRegistry>,
    puller: Option<CatalogPuller>,
    events: Option<mpsc::UnboundedSender<NodeEvent>>,
}

impl DiscoveryListener {
    /// Bind the discovery port with address reuse so several nodes on one
    /// host can listen side by side. Failure here is fatal for the node.
    pub fn bind(
        port: u16,
        own_identifier: NodeIdentifier,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self, P2PError> {
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        let socket = bind_reusable(addr).map_err(|source| P2PError::Bind {
            what: "discovery listener",
            addr,
            source,
        })?;

        tracing::info!(
            "Listening for announcements on {}",
            socket.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            socket,
            own_identifier,
            registry,
            puller: None,
            events: None,
        })
    }

    /// Pull the catalog of every peer that announces itself
    pub fn with_puller(mut self, puller: CatalogPuller) -> Self {
        self.puller = Some(puller);
        self
    }

    /// Report newly discovered peers on this channel
    pub fn with_events(mut self, events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, P2PError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until the task is dropped. No single datagram or read error
    /// stops the loop.
    pub async fn run(self) {
        // One spare byte tells an exactly-full datagram from a truncated one
        let mut buffer = [0u8; MAX_DATAGRAM_BYTES + 1];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, from)) => {
                    self.handle_datagram(&buffer[..len], from);
                }
                Err(e) => {
                    tracing::warn!("Discovery receive error: {}", e);
                    tokio::time::sleep(RECV_ERROR_PAUSE).await;
                }
            }
        }
    }

    /// Validate one datagram and act on it
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> DatagramOutcome {
        let announcement = match Announcement::parse(datagram) {
            Ok(announcement) => announcement,
            Err(e) => {
                if e.is_noise() {
                    tracing::trace!("Ignoring datagram from {}: {}", from, e);
                } else {
                    tracing::warn!("Malformed announcement from {}: {}", from, e);
                }
                return DatagramOutcome::Discarded(e);
            }
        };

        if announcement.identifier == self.own_identifier {
            tracing::trace!("Ignoring own announcement from {}", from);
            return DatagramOutcome::OwnAnnouncement;
        }

        let (peer, is_new) = self.registry.upsert_tracked(
            &announcement.identifier,
            from.ip(),
            announcement.exchange_port,
        );

        if is_new {
            tracing::info!(
                "Added new peer: {} at {} (exchange port {})",
                peer.identifier,
                peer.address,
                peer.exchange_port
            );
            if let Some(events) = &self.events {
                let _ = events.send(NodeEvent::PeerDiscovered(peer.clone()));
            }
        } else {
            tracing::debug!("Refreshed peer {} at {}", peer.identifier, peer.exchange_addr());
        }

        if let Some(puller) = &self.puller {
            puller.request(peer.clone());
        }

        DatagramOutcome::Discovered(peer)
    }
}

fn bind_reusable(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}
