//! # stagelink-sync: Display Synchronization for StageLink
//!
//! Keeps a controller and its displays in step over the local network:
//! discovery, pairing, sessions, leader designation, the control protocol
//! and heartbeat liveness.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Synchronization Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncNode (Main Orchestrator)                  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Discovery    │  │  Connection    │  │  BroadcastCoordinator  │    │
//! │  │                │  │  Manager       │  │                        │    │
//! │  │ mDNS + UDP     │  │ One session    │  │ lyrics / slide /       │    │
//! │  │ scan/advertise │  │ per peer,      │  │ precache fan-out,      │    │
//! │  │                │  │ registry,      │  │ resync on reconnect    │    │
//! │  │                │  │ leader, relay  │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                              │                                          │
//! │         ┌────────────────────┼─────────────────────┐                   │
//! │         ▼                    ▼                     ▼                    │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Transport    │  │   Signaling    │  │  Liveness / Pairing    │    │
//! │  │ WebSocket +    │  │ offer/answer/  │  │ heartbeats, stale      │    │
//! │  │ axum server    │  │ candidates     │  │ sweep, pairing codes   │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  EVENTS (SyncNode::subscribe):                                         │
//! │  • PeersChanged • LeaderChanged • ConnectionStateChanged • Message     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`node`] - `SyncNode` orchestrator and builder
//! - [`config`] - Node configuration (TOML + environment)
//! - [`error`] - Sync error types
//! - [`protocol`] - JSON control messages
//! - [`transport`] - Channels and the WebSocket client
//! - [`server`] - axum WebSocket endpoint
//! - [`connection`] - Session table, handshake, relay, negotiation driver
//! - [`registry`] - Peer registry and leader recomputation
//! - [`signaling`] - Offer/answer/candidate state machine
//! - [`discovery`] - mDNS + UDP display discovery
//! - [`pairing`] - Pairing code issue and redemption, local or over a session
//! - [`screen`] - EDID of attached screens for a stable display id
//! - [`liveness`] - Heartbeats and stale sweep
//! - [`broadcast`] - Presentation state fan-out and precache
//! - [`content`] - Content collaborator trait
//! - [`store`] - Display registry collaborator trait
//! - [`event`] - Events published to subscribers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagelink_db::{Database, DbConfig};
//! use stagelink_sync::{SyncConfig, SyncNodeBuilder};
//!
//! let config = SyncConfig::load_or_init(None)?;
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let node = SyncNodeBuilder::new(config)
//!     .with_store(Arc::new(db))
//!     .start()
//!     .await?;
//!
//! for display in node.discover(None).await? {
//!     node.connect_display(&display).await?;
//! }
//! println!("Leader: {:?}", node.leader_status().await.leader_id);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod content;
pub mod discovery;
pub mod error;
pub mod event;
pub mod liveness;
pub mod node;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod screen;
pub mod server;
pub mod signaling;
pub mod store;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use broadcast::{
    BroadcastCoordinator, LyricsUpdate, PrecacheFailure, PrecacheReport, PresentationState,
    SlideUpdate,
};
pub use config::SyncConfig;
pub use connection::{ConnectionInfo, ConnectionManager, ManagerSettings};
pub use content::{ContentSource, EventItem, Media, NoContent, Song};
pub use discovery::Advertisement;
pub use error::{SyncError, SyncResult};
pub use event::SyncEvent;
pub use liveness::LivenessMonitor;
pub use node::{SyncNode, SyncNodeBuilder};
pub use pairing::PairingService;
pub use protocol::ControlMessage;
pub use store::DisplayStore;
pub use transport::{Channel, ChannelHandle, ConnectionState, Transport, WebSocketTransport};
