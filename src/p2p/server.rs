//! Catalog exchange server - answers catalog requests from peers

use super::protocol::{read_frame, write_frame, CatalogAction, CatalogRequest, CatalogResponse};
use super::P2PError;
use crate::catalog::CatalogProvider;
use crate::identity::NodeIdentifier;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) doesn't spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// TCP server handing out catalog snapshots
pub struct ExchangeServer {
    listener: TcpListener,
    identifier: NodeIdentifier,
    provider: Arc<dyn CatalogProvider>,
    read_timeout: Duration,
    max_request_bytes: usize,
}

struct ConnectionHandler {
    identifier: NodeIdentifier,
    provider: Arc<dyn CatalogProvider>,
    read_timeout: Duration,
    max_request_bytes: usize,
}

impl ExchangeServer {
    /// Bind the listening socket. Failure here is fatal for the node.
    pub async fn bind(
        addr: SocketAddr,
        identifier: NodeIdentifier,
        provider: Arc<dyn CatalogProvider>,
    ) -> Result<Self, P2PError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| P2PError::Bind {
            what: "exchange listener",
            addr,
            source,
        })?;

        tracing::info!(
            "Catalog exchange listening on {}",
            listener.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            listener,
            identifier,
            provider,
            read_timeout: super::client::DEFAULT_READ_TIMEOUT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    /// Deadline for receiving the request and for sending the response
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, P2PError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Connection tasks belong to this future: dropping or aborting it
    /// aborts every connection still being served.
    pub async fn run(self) {
        let handler = Arc::new(ConnectionHandler {
            identifier: self.identifier,
            provider: self.provider,
            read_timeout: self.read_timeout,
            max_request_bytes: self.max_request_bytes,
        });
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!("Accepted connection from {}", remote);
                        let handler = handler.clone();
                        connections.spawn(async move {
                            match handler.serve(stream, remote).await {
                                Ok(()) => {}
                                Err(e @ P2PError::Catalog(_)) => {
                                    tracing::error!("Failed to serve catalog to {}: {}", remote, e);
                                }
                                Err(e) => {
                                    tracing::warn!("Closing connection from {}: {}", remote, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

impl ConnectionHandler {
    /// One request, at most one response, then close
    async fn serve(&self, stream: TcpStream, remote: SocketAddr) -> Result<(), P2PError> {
        let (mut reader, mut writer) = stream.into_split();

        let request: CatalogRequest =
            timeout(self.read_timeout, read_frame(&mut reader, self.max_request_bytes))
                .await
                .map_err(|_| P2PError::Timeout)??;

        tracing::debug!(
            "Received request from peer {} at {}: {}",
            request.identifier,
            remote,
            request.action
        );

        match request.action() {
            Some(CatalogAction::GetFileList) => {
                let files = self.provider.snapshot().await?;
                let count = files.len();

                let response = CatalogResponse::new(&self.identifier, files);
                timeout(self.read_timeout, async {
                    write_frame(&mut writer, &response).await?;
                    writer.shutdown().await?;
                    Ok::<_, P2PError>(())
                })
                .await
                .map_err(|_| P2PError::Timeout)??;

                tracing::info!("Sent file list to peer {} ({} files)", request.identifier, count);
                Ok(())
            }
            None => Err(P2PError::Protocol(format!(
                "unsupported action {:?} from peer {}",
                request.action, request.identifier
            ))),
        }
    }
}
