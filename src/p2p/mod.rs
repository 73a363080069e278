//! P2P Networking Module - LAN discovery and catalog exchange
//!
//! Nodes announce themselves with a small UDP broadcast, track whoever they
//! hear in a [`PeerRegistry`], and pull each peer's file catalog over a
//! one-shot TCP request/response exchange.

mod announcer;
mod client;
mod listener;
mod node;
mod protocol;
mod puller;
mod registry;
mod server;

pub use announcer::{Announcer, DatagramSink};
pub use client::ExchangeClient;
pub use listener::{DatagramOutcome, DiscoveryListener};
pub use node::{NodeEvent, ReplinkNode};
pub use protocol::{
    Announcement, AnnouncementError, CatalogAction, CatalogRequest, CatalogResponse,
    DEFAULT_EXCHANGE_PORT, DISCOVERY_PORT, FIELD_SEPARATOR, MAX_DATAGRAM_BYTES, MESSAGE_PREFIX,
};
pub use puller::{CatalogPuller, RetryPolicy};
pub use registry::{PeerRecord, PeerRegistry};
pub use server::ExchangeServer;

use crate::catalog::CatalogError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Timeout")]
    Timeout,
}

impl From<io::Error> for P2PError {
    /// A reset or half-finished stream means the other side hung up on us.
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => P2PError::ConnectionClosed,
            _ => P2PError::Io(e),
        }
    }
}
