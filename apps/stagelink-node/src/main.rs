//! # StageLink Node
//!
//! Runs one StageLink peer, controller or display, as set by `node.role`.
//!
//! ```text
//! stagelink-node [path/to/node.toml]
//!
//! RUST_LOG=stagelink_sync=debug     verbose session logging
//! STAGELINK_ROLE=display            run as a display
//! STAGELINK_PORT=3020               WebSocket port
//! ```
//!
//! A controller scans for displays once at startup and connects to every
//! one it finds. Displays advertise themselves and wait to be dialed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stagelink_core::PeerRole;
use stagelink_db::{Database, DbConfig};
use stagelink_sync::{SyncConfig, SyncEvent, SyncNode, SyncNodeBuilder};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load_or_init(config_path).context("loading node config")?;
    info!(
        node_id = %config.node_id(),
        role = %config.node.role,
        org_id = %config.org_id(),
        "Configuration loaded"
    );

    let db_path = config.database_path();
    let db = Database::new(DbConfig::new(db_path.clone()))
        .await
        .with_context(|| format!("opening display registry at {}", db_path.display()))?;

    let node = SyncNodeBuilder::new(config)
        .with_store(Arc::new(db))
        .start()
        .await
        .context("starting sync node")?;
    info!(endpoint = %node.local_endpoint(), "Node ready");

    let logger = tokio::spawn(log_events(node.subscribe()));

    if node.identity().role() == PeerRole::Controller {
        connect_discovered(&node).await;
    }

    shutdown_signal().await;
    node.shutdown().await;
    logger.abort();

    info!("Node shutdown complete");
    Ok(())
}

/// ## Log Levels
/// - `RUST_LOG=debug` - everything
/// - Default: info, with stagelink crates at debug and sqlx at warn
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stagelink_sync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn connect_discovered(node: &SyncNode) {
    let displays = match node.discover(None).await {
        Ok(displays) => displays,
        Err(e) => {
            warn!(error = %e, "Display scan failed");
            return;
        }
    };
    info!(count = displays.len(), "Display scan finished");

    for found in &displays {
        match node.connect_display(found).await {
            Ok(peer_id) => info!(peer_id = %peer_id, name = %found.name, "Display connected"),
            Err(e) => warn!(
                name = %found.name,
                host = %found.host,
                port = found.port,
                error = %e,
                "Could not connect to display"
            ),
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::PeersChanged(peers)) => {
                let connected = peers.iter().filter(|p| p.is_connected).count();
                info!(peers = peers.len(), connected, "Peers changed");
            }
            Ok(SyncEvent::LeaderChanged(status)) => {
                info!(leader = ?status.leader_id, am_i_leader = status.am_i_leader, "Leader changed");
            }
            Ok(SyncEvent::ConnectionStateChanged { peer_id, state }) => {
                info!(peer_id = %peer_id, state = ?state, "Connection state changed");
            }
            Ok(SyncEvent::Message { from, message }) => {
                info!(from = %from, msg_type = %message.type_name(), "Message received");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
