use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvflood::api;
use kvflood::cli;
use kvflood::node::KvNode;
use kvflood::transport::{TcpReceiver, TcpTransport};

const MAX_CONNECTIONS_PER_PEER: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvflood=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings()?;
    settings.validate()?;
    let http_address = settings.http_socket_addr()?;
    let tcp_address = settings.tcp_socket_addr()?;

    let transport = Arc::new(TcpTransport::new(
        settings.node_name.clone(),
        Duration::from_millis(settings.kvstore.sync_timeout_ms),
        MAX_CONNECTIONS_PER_PEER,
    ));
    let node = KvNode::start(&settings, transport).await?;

    // Peer traffic
    let (inbound_tx, inbound_rx) = mpsc::channel(settings.kvstore.command_queue_size);
    let receiver = TcpReceiver::new(tcp_address, inbound_tx).await?;
    let _receiver_task = receiver.start();
    let _peer_task = node.serve_peers(inbound_rx);

    // Build Axum Router
    let api = api::api(node).await?;

    // Start server
    info!(
        "Starting kvflood node {} on {} (peers on {})",
        settings.node_name, http_address, tcp_address
    );
    let listener = tokio::net::TcpListener::bind(http_address).await?;
    axum::serve(listener, api).await?;

    Ok(())
}
