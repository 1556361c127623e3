//! # Sync Server
//!
//! The local WebSocket endpoint other peers connect to. Every node runs one;
//! upgraded sockets are wrapped into the same [`Channel`] shape the client
//! transport produces and handed to [`ConnectionManager::accept`].
//!
//! ## Routes
//! ```text
//! GET /ws      → WebSocket upgrade → register handshake → session
//! GET /health  → {"status":"ok","peerId":...,"connections":n}
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};
use crate::protocol::ControlMessage;
use crate::transport::{Channel, ChannelHandle};

/// Maximum WebSocket message size. Precache bundles are the largest frames.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// How long shutdown waits for the server task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ServerState {
    manager: ConnectionManager,
    buffer: usize,
}

/// Handle for controlling the running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to. Useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits briefly for the server task.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            warn!("Server did not stop in time, aborting");
            self.task.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        // No-op once shutdown() has run
        self.task.abort();
    }
}

/// Binds the listener. Split from [`serve`] so callers learn the port
/// (possibly ephemeral) before the manager exists.
pub async fn bind(bind_address: &str) -> SyncResult<TcpListener> {
    TcpListener::bind(bind_address).await.map_err(|e| {
        SyncError::ServerFailed(format!("Failed to bind to {}: {}", bind_address, e))
    })
}

/// Serves `/ws` and `/health` on `listener`.
pub fn serve(
    listener: TcpListener,
    manager: ConnectionManager,
    buffer: usize,
) -> SyncResult<ServerHandle> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let local_addr = listener.local_addr()?;

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(ServerState { manager, buffer });

    info!(addr = %local_addr, "Sync server started");

    let task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await;
            info!("Sync server shutting down");
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Sync server stopped with error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

/// Binds `bind_address` and serves on it.
pub async fn start(
    bind_address: &str,
    manager: ConnectionManager,
    buffer: usize,
) -> SyncResult<ServerHandle> {
    serve(bind(bind_address).await?, manager, buffer)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    peer_id: String,
    connections: usize,
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        peer_id: state.manager.local_id().to_string(),
        connections: state.manager.connected_peers().await.len(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(addr = %addr, "WebSocket upgrade");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: ServerState, addr: SocketAddr) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(state.buffer);
    let (incoming_tx, incoming_rx) = mpsc::channel(state.buffer);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        match server_pump(socket, outgoing_rx, incoming_tx, shutdown_rx).await {
            Ok(()) => debug!(addr = %addr, "Inbound session closed"),
            Err(e) => warn!(addr = %addr, error = %e, "Inbound session ended with error"),
        }
    });

    let channel = Channel::new(
        ChannelHandle::new(outgoing_tx, shutdown_tx),
        incoming_rx,
        Some(addr),
    );
    match state.manager.accept(channel).await {
        Ok(peer_id) => info!(peer_id = %peer_id, addr = %addr, "Inbound peer registered"),
        Err(e) => warn!(addr = %addr, error = %e, "Inbound peer rejected"),
    }
}

/// Moves frames between an axum socket and the channel queues.
async fn server_pump(
    socket: WebSocket,
    mut outgoing_rx: mpsc::Receiver<ControlMessage>,
    incoming_tx: mpsc::Sender<ControlMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> SyncResult<()> {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = outgoing_rx.recv() => {
                let Some(msg) = msg else {
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(());
                };
                let json = msg.to_json()?;
                sender
                    .send(Message::Text(json.into()))
                    .await
                    .map_err(|e| SyncError::WebSocketError(e.to_string()))?;
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match ControlMessage::from_json(text.as_str()) {
                            Ok(msg) => {
                                if incoming_tx.send(msg).await.is_err() {
                                    let _ = sender.send(Message::Close(None)).await;
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping unparseable message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Binary(_))) => warn!("Received unexpected binary message"),
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Err(e)) => return Err(SyncError::WebSocketError(e.to_string())),
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
