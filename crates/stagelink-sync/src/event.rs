//! # Sync Events
//!
//! Outbound notifications for the UI layer, delivered through a
//! `tokio::sync::broadcast` subscription ([`crate::SyncNode::subscribe`]).
//! Slow subscribers lag and lose the oldest events; every event carries a
//! full snapshot rather than a delta, so the next one catches them up.

use stagelink_core::{LeaderStatus, PeerId, PeerInfo};

use crate::protocol::ControlMessage;
use crate::transport::ConnectionState;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Membership changed. Carries the full peer list.
    PeersChanged(Vec<PeerInfo>),

    /// The computed leader changed.
    LeaderChanged(LeaderStatus),

    /// A session moved to another state.
    ConnectionStateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },

    /// Application message received from a peer.
    Message {
        from: PeerId,
        message: ControlMessage,
    },
}

impl SyncEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::PeersChanged(_) => "peers_changed",
            SyncEvent::LeaderChanged(_) => "leader_changed",
            SyncEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SyncEvent::Message { .. } => "message",
        }
    }
}
