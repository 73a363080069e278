//! Catalog exchange client - pulls one peer's catalog

use super::protocol::{read_frame, write_frame, CatalogRequest, CatalogResponse};
use super::P2PError;
use crate::identity::NodeIdentifier;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Opens a fresh connection per pull and makes a single attempt.
/// Retrying is left to the caller.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    identifier: NodeIdentifier,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_response_bytes: usize,
}

impl ExchangeClient {
    pub fn new(identifier: NodeIdentifier) -> Self {
        Self {
            identifier,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    /// Request the catalog served at `addr`
    pub async fn fetch_catalog(&self, addr: SocketAddr) -> Result<CatalogResponse, P2PError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(P2PError::ConnectionFailed(format!(
                    "failed to connect to peer {}: {}",
                    addr, e
                )))
            }
            Err(_) => return Err(P2PError::Timeout),
        };
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, &CatalogRequest::get_file_list(&self.identifier)).await?;

        let response: CatalogResponse =
            timeout(self.read_timeout, read_frame(&mut reader, self.max_response_bytes))
                .await
                .map_err(|_| P2PError::Timeout)??;

        tracing::debug!(
            "Received file list from peer {} at {} ({} files)",
            response.identifier,
            addr,
            response.files.len()
        );
        Ok(response)
    }
}
