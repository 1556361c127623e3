//! # Peer Registry
//!
//! Membership and leader designation as computed by this process.
//!
//! ## Two Views
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  COMPUTED VIEW (ours)                 REPORTED VIEW (theirs)            │
//! │  ────────────────────                 ──────────────────────            │
//! │  local peer + every session we hold   last `peerList` a peer pushed     │
//! │  leader = select_leader(connected)    leader = whoever they marked      │
//! │  pushed to members as `peerList`      kept for the UI, never trusted    │
//! │                                                                         │
//! │  Two registries that cannot see each other may pick different leaders.  │
//! │  That is accepted: leadership is advisory.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Disconnected members stay listed until [`MAX_DISCONNECTED_MEMBERS`] newer
//! ones push them out.
//!
//! The registry is plain data. The connection manager owns it behind its
//! mutex and decides when to recompute and push.

use std::collections::HashMap;

use stagelink_core::election::{select_leader, Candidate};
use stagelink_core::{LeaderStatus, PeerId, PeerIdentity, PeerInfo};

use crate::protocol::{ControlMessage, PeerListPayload};

/// Disconnected members kept for display before the oldest is forgotten.
pub const MAX_DISCONNECTED_MEMBERS: usize = 32;

#[derive(Debug, Clone)]
struct Member {
    identity: PeerIdentity,
    connected: bool,
    /// Order of the last disconnect; larger is more recent.
    disconnected_at: u64,
}

/// Known peers and the leader computed among them.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local: PeerIdentity,
    members: HashMap<PeerId, Member>,
    leader: Option<PeerId>,
    reported: Option<PeerListPayload>,
    disconnects: u64,
}

impl PeerRegistry {
    /// Creates a registry containing only the local peer, which leads.
    pub fn new(local: PeerIdentity) -> Self {
        let leader = Some(local.id().to_string());
        PeerRegistry {
            local,
            members: HashMap::new(),
            leader,
            reported: None,
            disconnects: 0,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Adds or refreshes a member and marks it connected. Returns true if
    /// membership changed.
    pub fn upsert(&mut self, identity: PeerIdentity) -> bool {
        let id = identity.id().to_string();
        match self.members.get_mut(&id) {
            Some(member) if member.connected && member.identity == identity => false,
            Some(member) => {
                member.identity = identity;
                member.connected = true;
                true
            }
            None => {
                self.members.insert(
                    id,
                    Member {
                        identity,
                        connected: true,
                        disconnected_at: 0,
                    },
                );
                true
            }
        }
    }

    /// Keeps a member but marks it disconnected, forgetting the oldest
    /// disconnected members beyond [`MAX_DISCONNECTED_MEMBERS`].
    pub fn mark_disconnected(&mut self, peer_id: &str) -> bool {
        match self.members.get_mut(peer_id) {
            Some(member) if member.connected => {
                self.disconnects += 1;
                member.connected = false;
                member.disconnected_at = self.disconnects;
            }
            _ => return false,
        }
        self.prune_disconnected();
        true
    }

    fn prune_disconnected(&mut self) {
        let mut gone: Vec<(u64, PeerId)> = self
            .members
            .iter()
            .filter(|(_, m)| !m.connected)
            .map(|(id, m)| (m.disconnected_at, id.clone()))
            .collect();
        if gone.len() <= MAX_DISCONNECTED_MEMBERS {
            return;
        }
        gone.sort();
        let excess = gone.len() - MAX_DISCONNECTED_MEMBERS;
        for (_, id) in gone.into_iter().take(excess) {
            self.members.remove(&id);
        }
    }

    /// Forgets a member entirely.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        self.members.remove(peer_id).is_some()
    }

    /// Drops every member.
    pub fn clear(&mut self) {
        self.members.clear();
        self.reported = None;
        self.leader = Some(self.local.id().to_string());
    }

    /// Recomputes the leader. Returns true if it changed.
    ///
    /// The local peer is always a connected candidate.
    pub fn recompute(&mut self) -> bool {
        let leader = {
            let local = Candidate::new(self.local.id(), self.local.priority(), true);
            let others = self.members.values().map(|m| {
                Candidate::new(m.identity.id(), m.identity.priority(), m.connected)
            });
            select_leader(std::iter::once(local).chain(others)).map(str::to_string)
        };

        if leader == self.leader {
            return false;
        }
        self.leader = leader;
        true
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.members.get(peer_id).is_some_and(|m| m.connected)
    }

    /// Number of connected peers, the local peer included.
    pub fn connected_count(&self) -> usize {
        1 + self.members.values().filter(|m| m.connected).count()
    }

    pub fn leader_status(&self) -> LeaderStatus {
        LeaderStatus {
            leader_id: self.leader.clone(),
            am_i_leader: self.leader.as_deref() == Some(self.local.id()),
            peer_count: self.connected_count(),
        }
    }

    /// Full membership, local peer first, then by id.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let leader = self.leader.as_deref();
        let mut others: Vec<PeerInfo> = self
            .members
            .values()
            .map(|m| PeerInfo {
                id: m.identity.id().to_string(),
                role: m.identity.role(),
                display_name: m.identity.display_name().to_string(),
                is_connected: m.connected,
                is_leader: leader == Some(m.identity.id()),
            })
            .collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));

        let mut peers = Vec::with_capacity(others.len() + 1);
        peers.push(PeerInfo {
            id: self.local.id().to_string(),
            role: self.local.role(),
            display_name: self.local.display_name().to_string(),
            is_connected: true,
            is_leader: leader == Some(self.local.id()),
        });
        peers.extend(others);
        peers
    }

    /// The `peerList` message pushed to members.
    pub fn peer_list_message(&self) -> ControlMessage {
        ControlMessage::PeerList(PeerListPayload {
            sender_id: self.local.id().to_string(),
            leader_id: self.leader.clone(),
            peers: self.snapshot(),
        })
    }

    /// Stores a `peerList` received from a peer.
    pub fn apply_reported(&mut self, payload: PeerListPayload) {
        self.reported = Some(payload);
    }

    /// The last `peerList` received, if any.
    pub fn reported(&self) -> Option<&PeerListPayload> {
        self.reported.as_ref()
    }

    /// Leader according to the last received `peerList`.
    pub fn reported_leader(&self) -> Option<&str> {
        let reported = self.reported.as_ref()?;
        reported.leader_id.as_deref().or_else(|| {
            reported
                .peers
                .iter()
                .find(|p| p.is_leader)
                .map(|p| p.id.as_str())
        })
    }
}
