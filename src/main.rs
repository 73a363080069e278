use anyhow::Context;
use clap::Parser;
use replink_core::catalog::FileIndex;
use replink_core::p2p::{NodeEvent, ReplinkNode};
use replink_core::ReplinkConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Records printed from each received catalog
const SAMPLE_RECORDS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "replink", version, about = "Discover LAN peers and exchange file catalogs")]
struct Cli {
    /// Directory to index and advertise
    #[arg(default_value = ".")]
    directory: PathBuf,

    /// TCP port to serve the catalog on
    exchange_port: Option<u16>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Index database location
    #[arg(long, default_value = "files.db")]
    db: PathBuf,

    /// Override the announcement destination
    #[arg(long)]
    broadcast: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ReplinkConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ReplinkConfig::default(),
    };
    if let Some(port) = cli.exchange_port {
        config.exchange_port = port;
    }
    if let Some(addr) = cli.broadcast {
        config.broadcast_address = addr;
    }

    let index = FileIndex::open(&cli.db)
        .with_context(|| format!("failed to open index {}", cli.db.display()))?;

    // An unreadable directory still leaves us with whatever was indexed before
    if let Err(e) = index.index_directory(&cli.directory) {
        tracing::warn!("Failed to index {}: {}", cli.directory.display(), e);
    }

    let mut node = ReplinkNode::start(&config, Arc::new(index))
        .await
        .context("failed to start node")?;

    tracing::info!(
        "Sharing file lists as {} (exchange port {}). Press Ctrl+C to exit",
        node.identifier,
        node.exchange_addr().port()
    );

    loop {
        tokio::select! {
            event = node.next_event() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered(peer) => {
            tracing::info!("Discovered peer {} at {}", peer.identifier, peer.exchange_addr());
        }
        NodeEvent::CatalogReceived { peer, catalog } => {
            tracing::info!("Files received from {}: {}", peer.identifier, catalog.files.len());
            for (i, file) in catalog.files.iter().take(SAMPLE_RECORDS).enumerate() {
                match serde_json::to_string_pretty(file) {
                    Ok(json) => tracing::info!("File {}: {}", i + 1, json),
                    Err(e) => tracing::warn!("File {}: unprintable record: {}", i + 1, e),
                }
            }
            if catalog.files.len() > SAMPLE_RECORDS {
                tracing::info!("... and {} more files", catalog.files.len() - SAMPLE_RECORDS);
            }
        }
        NodeEvent::PullFailed { peer, error } => {
            tracing::warn!("Could not pull catalog from {}: {}", peer.identifier, error);
        }
        NodeEvent::PeersExpired(peers) => {
            for peer in peers {
                tracing::info!("Forgot peer {}", peer.identifier);
            }
        }
    }
}
