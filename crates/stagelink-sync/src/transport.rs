//! # Session Transport
//!
//! A transport turns an endpoint into a [`Channel`]: a handle for sending
//! [`ControlMessage`]s plus a receiver for the ones coming back. Socket I/O
//! lives in a pump task per channel, so callers only ever touch bounded
//! mpsc queues.
//!
//! ## Channel Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Channel                                    │
//! │                                                                         │
//! │   ChannelHandle ──send()──► outgoing mpsc ──┐                           │
//! │        │                                    ▼                           │
//! │        └──close()──► shutdown mpsc ──► ┌──────────┐ ◄──► socket         │
//! │                                        │   pump   │                     │
//! │   incoming: Receiver ◄── incoming mpsc ┤   task   │                     │
//! │                                        └──────────┘                     │
//! │                                                                         │
//! │   The pump exits on close(), socket close/error, or when every handle  │
//! │   is dropped. After that `is_closed()` is true and `incoming` ends.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection States
//! ```text
//!   Discovered ──► Negotiating ──► Connected ──► Disconnected
//!        │              │
//!        └──────────────┴──────► Failed
//! ```
//!
//! There is no reconnection here. A closed channel stays closed; whoever
//! wants the peer back opens a new one.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::ControlMessage;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of a session with one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Endpoint known, nothing opened yet.
    Discovered,
    /// Exchanging offer/answer/candidates through a rendezvous peer.
    Negotiating,
    /// Handshake complete, messages flow.
    Connected,
    /// Session ended.
    Disconnected,
    /// Negotiation or connect gave up.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Channel Handle
// =============================================================================

/// Sending side of a channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outgoing_tx: mpsc::Sender<ControlMessage>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ChannelHandle {
    pub fn new(outgoing_tx: mpsc::Sender<ControlMessage>, shutdown_tx: mpsc::Sender<()>) -> Self {
        ChannelHandle {
            outgoing_tx,
            shutdown_tx,
        }
    }

    /// Queues a message without waiting.
    ///
    /// ## Errors
    /// - `SyncError::Disconnected` if the pump has exited
    /// - `SyncError::ChannelError` if the outgoing queue is full
    pub fn send(&self, message: ControlMessage) -> SyncResult<()> {
        self.outgoing_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => SyncError::Disconnected,
            mpsc::error::TrySendError::Full(msg) => SyncError::ChannelError(format!(
                "Outgoing queue full, dropped {}",
                msg.type_name()
            )),
        })
    }

    /// Asks the pump to close the socket. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// True once the pump has exited.
    pub fn is_closed(&self) -> bool {
        self.outgoing_tx.is_closed()
    }
}

// =============================================================================
// Channel
// =============================================================================

/// An open session: handle, inbound stream and where it came from.
#[derive(Debug)]
pub struct Channel {
    pub handle: ChannelHandle,
    pub incoming: mpsc::Receiver<ControlMessage>,
    /// Remote socket address, when the transport knows it.
    pub remote_addr: Option<SocketAddr>,
}

impl Channel {
    pub fn new(
        handle: ChannelHandle,
        incoming: mpsc::Receiver<ControlMessage>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Channel {
            handle,
            incoming,
            remote_addr,
        }
    }

    /// Two in-process channels wired to each other.
    ///
    /// Used for loopback sessions and tests. Each side gets its own pump,
    /// so closing one side ends the other side's `incoming` stream exactly
    /// like a socket close would.
    pub fn pair(buffer: usize) -> (Channel, Channel) {
        let (a_out_tx, a_out_rx) = mpsc::channel(buffer);
        let (b_out_tx, b_out_rx) = mpsc::channel(buffer);
        let (a_in_tx, a_in_rx) = mpsc::channel(buffer);
        let (b_in_tx, b_in_rx) = mpsc::channel(buffer);
        let (a_shutdown_tx, a_shutdown_rx) = mpsc::channel(1);
        let (b_shutdown_tx, b_shutdown_rx) = mpsc::channel(1);

        tokio::spawn(memory_pump(a_out_rx, a_shutdown_rx, b_in_tx));
        tokio::spawn(memory_pump(b_out_rx, b_shutdown_rx, a_in_tx));

        (
            Channel::new(ChannelHandle::new(a_out_tx, a_shutdown_tx), a_in_rx, None),
            Channel::new(ChannelHandle::new(b_out_tx, b_shutdown_tx), b_in_rx, None),
        )
    }
}

async fn memory_pump(
    mut outgoing_rx: mpsc::Receiver<ControlMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
    peer_incoming: mpsc::Sender<ControlMessage>,
) {
    loop {
        tokio::select! {
            msg = outgoing_rx.recv() => match msg {
                Some(msg) => {
                    if peer_incoming.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.recv() => break,
            _ = peer_incoming.closed() => break,
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Opens sessions to remote endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a channel to `endpoint`. Implementations must not retry.
    async fn open(&self, endpoint: &str) -> SyncResult<Channel>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time allowed for TCP connect plus the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Capacity of the outgoing and incoming queues.
    pub buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            buffer: 256,
        }
    }
}

/// The production transport: JSON text frames over WebSocket.
///
/// ## Usage
/// ```rust,ignore
/// let transport = WebSocketTransport::new(TransportConfig::default());
/// let mut channel = transport.open("ws://192.168.1.40:3010/ws").await?;
///
/// channel.handle.send(ControlMessage::heartbeat("console"))?;
/// while let Some(msg) = channel.incoming.recv().await {
///     println!("Received: {}", msg.type_name());
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: TransportConfig,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        WebSocketTransport { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &str) -> SyncResult<Channel> {
        let url = url::Url::parse(endpoint)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SyncError::InvalidUrl(format!(
                "Unsupported scheme '{}' in {}",
                url.scheme(),
                endpoint
            )));
        }

        debug!(endpoint = %endpoint, "Opening WebSocket session");

        let ws_stream = match timeout(self.config.connect_timeout, connect_async(endpoint)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => return Err(SyncError::from(e)),
            Err(_) => {
                return Err(SyncError::timeout(
                    format!("connect to {}", endpoint),
                    self.config.connect_timeout,
                ))
            }
        };

        let remote_addr = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.buffer);
        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.buffer);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = client_pump(ws_stream, outgoing_rx, incoming_tx, shutdown_rx).await {
                warn!(endpoint = %endpoint, error = %e, "WebSocket session ended with error");
            } else {
                debug!(endpoint = %endpoint, "WebSocket session closed");
            }
        });

        Ok(Channel::new(
            ChannelHandle::new(outgoing_tx, shutdown_tx),
            incoming_rx,
            remote_addr,
        ))
    }
}

/// Moves frames between a tungstenite stream and the channel queues.
async fn client_pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::Receiver<ControlMessage>,
    incoming_tx: mpsc::Sender<ControlMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> SyncResult<()> {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            // Outgoing messages
            msg = outgoing_rx.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                };
                let json = msg.to_json()?;
                debug!(msg_type = %msg.type_name(), "Sending message");
                write.send(WsMessage::Text(json.into())).await?;
            }

            // Incoming frames
            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match ControlMessage::from_json(&text) {
                            Ok(msg) => {
                                debug!(msg_type = %msg.type_name(), "Received message");
                                if incoming_tx.send(msg).await.is_err() {
                                    let _ = write.send(WsMessage::Close(None)).await;
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping unparseable message");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(());
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("Received unexpected binary message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SyncError::from(e)),
                    None => return Ok(()),
                }
            }

            // Local close
            _ = shutdown_rx.recv() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
        }
    }
}
