//! # Control Protocol Messages
//!
//! Everything peers say to each other over a session.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Control Protocol Messages                          │
//! │                                                                         │
//! │  HANDSHAKE (both sides, first message on every session)               │
//! │  ─────────                                                             │
//! │  A ───► register { senderId, role, displayName, priority }             │
//! │  A ◄─── register { ... }                                               │
//! │                                                                         │
//! │  MEMBERSHIP                                                            │
//! │  ──────────                                                            │
//! │  Any  ───► heartbeat { senderId }                 every 5s / 10s       │
//! │  Hub  ───► peerList { peers, leaderId }           on every change      │
//! │                                                                         │
//! │  PRESENTATION (controller → displays)                                  │
//! │  ────────────                                                          │
//! │  lyrics   { songId, title, text, backgroundUrl?, timestamp }           │
//! │  slide    { songId, slideIndex, timestamp }                            │
//! │  precache { media[], songs[], timestamp }                              │
//! │                                                                         │
//! │  PAIRING (controller asks, the display holding the code answers)      │
//! │  ───────                                                               │
//! │  pairingRequest { orgId, code } ─► pairingResult { record?, expired }  │
//! │                                                                         │
//! │  NEGOTIATION (relayed through a rendezvous peer)                       │
//! │  ───────────                                                           │
//! │  offer { sdp } ─► answer { sdp } ─► iceCandidate { candidate } ...     │
//! │                                                                         │
//! │  ESCAPE HATCH                                                          │
//! │  data { payload: <any JSON> }                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Internally tagged JSON with camelCase fields; absent optionals are
//! omitted:
//! ```json
//! { "type": "slide", "senderId": "...", "songId": "s1", "slideIndex": 3, ... }
//! ```
//!
//! There is no sequence number. Ordering is per session only.

use serde::{Deserialize, Serialize};

use stagelink_core::{DisplayClass, PairingRecord, PeerIdentity, PeerInfo, PeerRole, Priority};

// =============================================================================
// Main Message Enum
// =============================================================================

/// All control protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Handshake: announces the sender's identity.
    Register(RegisterPayload),

    /// Sign of life.
    Heartbeat(HeartbeatPayload),

    /// Current song text.
    Lyrics(LyricsPayload),

    /// Current slide within the song.
    Slide(SlidePayload),

    /// Media and songs to stage before the presentation.
    Precache(PrecachePayload),

    /// Membership snapshot with leader designation.
    PeerList(PeerListPayload),

    /// Pairing: a controller asks displays to redeem a code.
    PairingRequest(PairingRequestPayload),

    /// Pairing: the display that issued the code answers.
    PairingResult(PairingResultPayload),

    /// Negotiation: session description from the initiator.
    Offer(SessionDescriptionPayload),

    /// Negotiation: session description from the responder.
    Answer(SessionDescriptionPayload),

    /// Negotiation: one reachable endpoint, or end-of-candidates.
    IceCandidate(IceCandidatePayload),

    /// Free-form application data.
    Data(DataPayload),
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub sender_id: String,
    pub role: PeerRole,
    pub display_name: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_class: Option<DisplayClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Port of the sender's own WebSocket endpoint, if it runs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl RegisterPayload {
    /// Rebuilds the sender's identity.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::from_parts(
            self.sender_id.clone(),
            self.role,
            self.display_name.clone(),
            self.priority,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub sender_id: String,
    /// Unix milliseconds at the sender.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LyricsPayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub org_id: String,
    pub event_id: String,
    pub song_id: String,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_url: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidePayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub org_id: String,
    pub event_id: String,
    pub song_id: String,
    pub slide_index: u32,
    pub timestamp: i64,
}

/// One media item in a precache bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheMedia {
    pub media_id: String,
    /// Signed, time-limited URL.
    pub url: String,
    /// "image", "video", ...
    pub kind: String,
    /// Unix milliseconds after which `url` stops working.
    pub expires_at: i64,
}

/// One song in a precache bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheSong {
    pub song_id: String,
    pub title: String,
    pub lyrics: String,
    /// Signed background URLs.
    #[serde(default)]
    pub backgrounds: Vec<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecachePayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub org_id: String,
    pub event_id: String,
    #[serde(default)]
    pub media: Vec<PrecacheMedia>,
    #[serde(default)]
    pub songs: Vec<PrecacheSong>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListPayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestPayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub org_id: String,
    pub code: String,
}

/// Only the display holding the code answers. `record` is the redeemed
/// pending record; `expired` is set when the code was found but too old.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResultPayload {
    pub sender_id: String,
    pub target_id: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<PairingRecord>,
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptionPayload {
    pub sender_id: String,
    pub target_id: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub sender_id: String,
    pub target_id: String,
    /// Empty string marks end-of-candidates.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidatePayload {
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub payload: serde_json::Value,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl ControlMessage {
    /// Returns the wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Register(_) => "register",
            ControlMessage::Heartbeat(_) => "heartbeat",
            ControlMessage::Lyrics(_) => "lyrics",
            ControlMessage::Slide(_) => "slide",
            ControlMessage::Precache(_) => "precache",
            ControlMessage::PeerList(_) => "peerList",
            ControlMessage::PairingRequest(_) => "pairingRequest",
            ControlMessage::PairingResult(_) => "pairingResult",
            ControlMessage::Offer(_) => "offer",
            ControlMessage::Answer(_) => "answer",
            ControlMessage::IceCandidate(_) => "iceCandidate",
            ControlMessage::Data(_) => "data",
        }
    }

    /// Peer that produced the message.
    pub fn sender_id(&self) -> &str {
        match self {
            ControlMessage::Register(p) => &p.sender_id,
            ControlMessage::Heartbeat(p) => &p.sender_id,
            ControlMessage::Lyrics(p) => &p.sender_id,
            ControlMessage::Slide(p) => &p.sender_id,
            ControlMessage::Precache(p) => &p.sender_id,
            ControlMessage::PeerList(p) => &p.sender_id,
            ControlMessage::PairingRequest(p) => &p.sender_id,
            ControlMessage::PairingResult(p) => &p.sender_id,
            ControlMessage::Offer(p) | ControlMessage::Answer(p) => &p.sender_id,
            ControlMessage::IceCandidate(p) => &p.sender_id,
            ControlMessage::Data(p) => &p.sender_id,
        }
    }

    /// Peer the message is addressed to, if it is not meant for everyone.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Lyrics(p) => p.target_id.as_deref(),
            ControlMessage::Slide(p) => p.target_id.as_deref(),
            ControlMessage::Precache(p) => p.target_id.as_deref(),
            ControlMessage::PairingRequest(p) => p.target_id.as_deref(),
            ControlMessage::PairingResult(p) => Some(&p.target_id),
            ControlMessage::Offer(p) | ControlMessage::Answer(p) => Some(&p.target_id),
            ControlMessage::IceCandidate(p) => Some(&p.target_id),
            ControlMessage::Data(p) => p.target_id.as_deref(),
            ControlMessage::Register(_)
            | ControlMessage::Heartbeat(_)
            | ControlMessage::PeerList(_) => None,
        }
    }

    /// True for offer/answer/iceCandidate.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            ControlMessage::Offer(_) | ControlMessage::Answer(_) | ControlMessage::IceCandidate(_)
        )
    }

    /// Creates the handshake message for `identity`.
    pub fn register(
        identity: &PeerIdentity,
        display_class: Option<DisplayClass>,
        org_id: Option<String>,
        listen_port: Option<u16>,
    ) -> Self {
        ControlMessage::Register(RegisterPayload {
            sender_id: identity.id().to_string(),
            role: identity.role(),
            display_name: identity.display_name().to_string(),
            priority: identity.priority(),
            display_class,
            org_id,
            listen_port,
        })
    }

    /// Creates a heartbeat stamped with the current time.
    pub fn heartbeat(sender_id: &str) -> Self {
        ControlMessage::Heartbeat(HeartbeatPayload {
            sender_id: sender_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
