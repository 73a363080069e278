//! Discovery announcer - periodic presence broadcast

use super::protocol::Announcement;
use super::P2PError;

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// Where announcement datagrams go out
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, target).await
    }
}

/// Broadcasts this node's announcement on a fixed cadence
pub struct Announcer {
    sink: Box<dyn DatagramSink>,
    target: SocketAddr,
    payload: String,
    interval: Duration,
    retry_backoff: Duration,
}

impl Announcer {
    /// Open the sending socket. Failure here is fatal for the node.
    ///
    /// Discovery runs over IPv4 only, so an IPv6 target is rejected here
    /// rather than failing on every send.
    pub async fn bind(announcement: &Announcement, target: SocketAddr) -> Result<Self, P2PError> {
        let local: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        let bind_error = |source: io::Error| P2PError::Bind {
            what: "announcer socket",
            addr: local,
            source,
        };

        if !target.is_ipv4() {
            return Err(bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("announcement target {} is not an IPv4 address", target),
            )));
        }

        let socket = UdpSocket::bind(local).await.map_err(bind_error)?;
        socket.set_broadcast(true).map_err(bind_error)?;

        Ok(Self::with_sink(Box::new(socket), announcement, target))
    }

    /// Announce through an already opened sink
    pub fn with_sink(
        sink: Box<dyn DatagramSink>,
        announcement: &Announcement,
        target: SocketAddr,
    ) -> Self {
        Self {
            sink,
            target,
            payload: announcement.encode(),
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            retry_backoff: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Pause after a failed send before trying again
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send a single announcement
    pub async fn announce_once(&self) -> Result<usize, P2PError> {
        Ok(self.sink.send_to(self.payload.as_bytes(), self.target).await?)
    }

    /// Send once and pick how long to wait before the next send
    async fn next_pause(&self) -> Duration {
        match self.announce_once().await {
            Ok(sent) => {
                tracing::trace!("Sent {} byte announcement to {}", sent, self.target);
                self.interval
            }
            Err(e) => {
                tracing::warn!("Announcement to {} failed: {}", self.target, e);
                self.retry_backoff
            }
        }
    }

    /// Announce until the task is dropped. Send failures are logged and retried.
    pub async fn run(self) {
        tracing::info!("Announcing {} to {} every {:?}", self.payload, self.target, self.interval);

        loop {
            let pause = self.next_pause().await;
            tokio::time::sleep(pause).await;
        }
    }
}
