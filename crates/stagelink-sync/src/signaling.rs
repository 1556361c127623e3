//! # Signaling Exchange
//!
//! Offer/answer/candidate bookkeeping for opening a direct session between
//! two peers that can only see each other through a rendezvous peer.
//!
//! ## Exchange
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Initiator                 Rendezvous                 Responder        │
//! │   ─────────                 ──────────                 ─────────        │
//! │   offer{sdp: S1} ─────────────► relay ─────────────────► new state S1  │
//! │                                                           (old state   │
//! │                                                            discarded)  │
//! │   answer S1 ◄───────────────── relay ◄──────────────── answer{sdp: S1} │
//! │   candidate ◄───────────────── relay ◄──────────────── ws://host:port  │
//! │   end       ◄───────────────── relay ◄──────────────── candidate ""    │
//! │                                                                         │
//! │   answer + end received ─► resolve with candidates                      │
//! │   initiator connects to the first candidate that works                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `sdp` field carries a JSON [`SessionDescription`]. Candidates tag
//! their session through `sdpMid`, so late candidates from a discarded
//! session are recognizable and dropped.
//!
//! ## Glare
//! When both peers send an offer to each other at once, the offer of the
//! peer with the greater id is kept. The other side abandons its own offer
//! and answers instead; its pending negotiation resolves as
//! [`Resolution::Yielded`].
//!
//! This table performs no I/O. It returns the messages to send and the
//! connection manager sends them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use stagelink_core::{PeerId, PeerIdentity, PeerRole};

use crate::protocol::{ControlMessage, IceCandidatePayload, SessionDescriptionPayload};

// =============================================================================
// Session Description
// =============================================================================

/// Content of the `sdp` field of `offer` and `answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub session_id: String,
    pub peer_id: PeerId,
    pub role: PeerRole,
    pub display_name: String,
}

impl SessionDescription {
    pub fn new(session_id: impl Into<String>, identity: &PeerIdentity) -> Self {
        SessionDescription {
            session_id: session_id.into(),
            peer_id: identity.id().to_string(),
            role: identity.role(),
            display_name: identity.display_name().to_string(),
        }
    }

    pub fn encode(&self) -> String {
        // A struct of strings always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(sdp: &str) -> Option<Self> {
        serde_json::from_str(sdp).ok()
    }
}

// =============================================================================
// Negotiation State
// =============================================================================

/// Which side of the exchange we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We sent the offer.
    Outbound,
    /// We answered an offer.
    Inbound,
}

/// How a pending outbound negotiation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Answer and end-of-candidates received; connect to one of these.
    Candidates(Vec<String>),
    /// Glare lost: the remote peer will connect to us instead.
    Yielded,
}

#[derive(Debug)]
struct Negotiation {
    session_id: String,
    direction: Direction,
    answered: bool,
    remote_complete: bool,
    remote_candidates: Vec<String>,
    waiter: Option<oneshot::Sender<Resolution>>,
    started_at: Instant,
}

impl Negotiation {
    fn new(session_id: String, direction: Direction) -> Self {
        Negotiation {
            session_id,
            direction,
            answered: false,
            remote_complete: false,
            remote_candidates: Vec::new(),
            waiter: None,
            started_at: Instant::now(),
        }
    }
}

/// Read-only view of one negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSnapshot {
    pub peer_id: PeerId,
    pub session_id: String,
    pub direction: Direction,
    pub answered: bool,
    pub remote_candidates: Vec<String>,
}

// =============================================================================
// Negotiation Table
// =============================================================================

/// At most one negotiation per remote peer.
#[derive(Debug)]
pub struct NegotiationTable {
    local: PeerIdentity,
    local_candidates: Vec<String>,
    sessions: HashMap<PeerId, Negotiation>,
}

impl NegotiationTable {
    /// `local_candidates` are the endpoints remote peers may use to reach
    /// us, e.g. `ws://192.168.1.10:3010/ws`.
    pub fn new(local: PeerIdentity, local_candidates: Vec<String>) -> Self {
        NegotiationTable {
            local,
            local_candidates,
            sessions: HashMap::new(),
        }
    }

    pub fn local_candidates(&self) -> &[String] {
        &self.local_candidates
    }

    /// Starts an outbound negotiation with `target`, replacing any previous
    /// one. Returns the messages to send through the rendezvous and the
    /// receiver that resolves when the exchange completes.
    pub fn begin(
        &mut self,
        target: &str,
    ) -> (Vec<ControlMessage>, oneshot::Receiver<Resolution>) {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let mut negotiation = Negotiation::new(session_id.clone(), Direction::Outbound);
        negotiation.waiter = Some(tx);
        if self.sessions.insert(target.to_string(), negotiation).is_some() {
            debug!(peer_id = %target, "Replacing previous negotiation");
        }

        let mut outgoing = vec![ControlMessage::Offer(SessionDescriptionPayload {
            sender_id: self.local.id().to_string(),
            target_id: target.to_string(),
            sdp: SessionDescription::new(&session_id, &self.local).encode(),
        })];
        outgoing.extend(self.candidate_messages(target, &session_id));

        debug!(peer_id = %target, session_id = %session_id, "Negotiation started");
        (outgoing, rx)
    }

    /// Applies an inbound negotiation message. Returns the replies to send
    /// back through the rendezvous.
    ///
    /// Messages not addressed to the local peer, not negotiation messages,
    /// or belonging to a discarded session are dropped.
    pub fn handle(&mut self, message: &ControlMessage) -> Vec<ControlMessage> {
        if message.target_id() != Some(self.local.id()) {
            debug!(
                msg_type = %message.type_name(),
                target = ?message.target_id(),
                "Dropping misaddressed negotiation message"
            );
            return Vec::new();
        }

        match message {
            ControlMessage::Offer(offer) => self.on_offer(offer),
            ControlMessage::Answer(answer) => {
                self.on_answer(answer);
                Vec::new()
            }
            ControlMessage::IceCandidate(candidate) => {
                self.on_candidate(candidate);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_offer(&mut self, offer: &SessionDescriptionPayload) -> Vec<ControlMessage> {
        let Some(description) = SessionDescription::decode(&offer.sdp) else {
            warn!(peer_id = %offer.sender_id, "Dropping offer with unreadable session description");
            return Vec::new();
        };
        let remote = offer.sender_id.as_str();

        if let Some(existing) = self.sessions.get_mut(remote) {
            if existing.direction == Direction::Outbound {
                if self.local.id() > remote {
                    debug!(peer_id = %remote, "Glare: keeping our offer");
                    return Vec::new();
                }
                debug!(peer_id = %remote, "Glare: yielding to remote offer");
                if let Some(waiter) = existing.waiter.take() {
                    let _ = waiter.send(Resolution::Yielded);
                }
            } else {
                debug!(
                    peer_id = %remote,
                    old_session = %existing.session_id,
                    new_session = %description.session_id,
                    "Renegotiation: discarding previous state"
                );
            }
        }

        let session_id = description.session_id;
        self.sessions.insert(
            remote.to_string(),
            Negotiation::new(session_id.clone(), Direction::Inbound),
        );

        let mut replies = vec![ControlMessage::Answer(SessionDescriptionPayload {
            sender_id: self.local.id().to_string(),
            target_id: remote.to_string(),
            sdp: SessionDescription::new(&session_id, &self.local).encode(),
        })];
        replies.extend(self.candidate_messages(remote, &session_id));
        replies
    }

    fn on_answer(&mut self, answer: &SessionDescriptionPayload) {
        let Some(description) = SessionDescription::decode(&answer.sdp) else {
            warn!(peer_id = %answer.sender_id, "Dropping answer with unreadable session description");
            return;
        };
        let Some(negotiation) = self.sessions.get_mut(&answer.sender_id) else {
            debug!(peer_id = %answer.sender_id, "Dropping answer without negotiation");
            return;
        };
        if negotiation.direction != Direction::Outbound
            || negotiation.session_id != description.session_id
        {
            debug!(peer_id = %answer.sender_id, "Dropping answer for stale session");
            return;
        }

        negotiation.answered = true;
        Self::try_resolve(negotiation);
    }

    fn on_candidate(&mut self, candidate: &IceCandidatePayload) {
        let Some(negotiation) = self.sessions.get_mut(&candidate.sender_id) else {
            debug!(peer_id = %candidate.sender_id, "Dropping candidate without negotiation");
            return;
        };
        if candidate.sdp_mid.as_deref() != Some(negotiation.session_id.as_str()) {
            debug!(peer_id = %candidate.sender_id, "Dropping candidate for stale session");
            return;
        }

        if candidate.is_end_of_candidates() {
            negotiation.remote_complete = true;
        } else if !negotiation.remote_candidates.contains(&candidate.candidate) {
            negotiation.remote_candidates.push(candidate.candidate.clone());
        }
        Self::try_resolve(negotiation);
    }

    fn try_resolve(negotiation: &mut Negotiation) {
        if negotiation.direction == Direction::Outbound
            && negotiation.answered
            && negotiation.remote_complete
        {
            if let Some(waiter) = negotiation.waiter.take() {
                debug!(
                    session_id = %negotiation.session_id,
                    candidates = negotiation.remote_candidates.len(),
                    elapsed_ms = negotiation.started_at.elapsed().as_millis() as u64,
                    "Negotiation converged"
                );
                let _ = waiter.send(Resolution::Candidates(negotiation.remote_candidates.clone()));
            }
        }
    }

    fn candidate_messages(&self, target: &str, session_id: &str) -> Vec<ControlMessage> {
        let candidate = |value: String| {
            ControlMessage::IceCandidate(IceCandidatePayload {
                sender_id: self.local.id().to_string(),
                target_id: target.to_string(),
                candidate: value,
                sdp_mid: Some(session_id.to_string()),
                sdp_m_line_index: Some(0),
            })
        };

        self.local_candidates
            .iter()
            .cloned()
            .chain(std::iter::once(String::new()))
            .map(candidate)
            .collect()
    }

    /// Forgets the negotiation with `peer_id`, typically once a session
    /// with it is established.
    pub fn complete(&mut self, peer_id: &str) -> bool {
        self.sessions.remove(peer_id).is_some()
    }

    /// Abandons the negotiation with `peer_id`. A pending waiter observes a
    /// closed channel.
    pub fn cancel(&mut self, peer_id: &str) -> bool {
        self.complete(peer_id)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, peer_id: &str) -> Option<NegotiationSnapshot> {
        self.sessions.get(peer_id).map(|n| NegotiationSnapshot {
            peer_id: peer_id.to_string(),
            session_id: n.session_id.clone(),
            direction: n.direction,
            answered: n.answered,
            remote_candidates: n.remote_candidates.clone(),
        })
    }
}
