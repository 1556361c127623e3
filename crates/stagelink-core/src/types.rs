//! # Domain Types
//!
//! Core types shared by every StageLink crate.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌─────────────────────┐  │
//! │  │  PeerIdentity   │   │  PairingRecord   │   │ RegisteredDisplay   │  │
//! │  │  ─────────────  │   │  ──────────────  │   │ ─────────────────── │  │
//! │  │  id             │   │  code            │   │ display_id (PK)     │  │
//! │  │  role           │   │  org_id          │   │ org_id, device_id   │  │
//! │  │  display_name   │   │  device identity │   │ class               │  │
//! │  │  priority       │   │  expires_at      │   │ host:port           │  │
//! │  └─────────────────┘   └──────────────────┘   │ last_seen_at        │  │
//! │                                               └─────────────────────┘  │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌─────────────────────┐  │
//! │  │    PeerRole     │   │   DisplayClass   │   │ DiscoveredDisplay   │  │
//! │  │  Controller (2) │   │   Audience       │   │ (scan result)       │  │
//! │  │  Display    (1) │   │   Stage, Lobby   │   └─────────────────────┘  │
//! │  └─────────────────┘   └──────────────────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Pattern
//! Every peer has an opaque string id (UUID v4, generated once per
//! installation). Displays additionally have a `display_id`, which is the
//! peer id of the display process and the primary key of the registry.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

/// Opaque peer identifier.
pub type PeerId = String;

// =============================================================================
// Peer Role
// =============================================================================

/// What a peer does in a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Drives the presentation (operator console).
    Controller,
    /// Renders lyrics and slides.
    Display,
}

impl PeerRole {
    /// Weight used by leader election. Controllers always outrank displays.
    pub const fn weight(&self) -> u8 {
        match self {
            PeerRole::Controller => 2,
            PeerRole::Display => 1,
        }
    }

    /// Returns the role as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Controller => "controller",
            PeerRole::Display => "display",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "controller" => Ok(PeerRole::Controller),
            "display" => Ok(PeerRole::Display),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

// =============================================================================
// Display Class
// =============================================================================

/// Where a registered display is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DisplayClass {
    /// Main screen facing the congregation or audience.
    #[default]
    Audience,
    /// Confidence monitor facing the stage.
    Stage,
    /// Informational screen outside the main room.
    Lobby,
}

impl DisplayClass {
    /// Returns the class as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DisplayClass::Audience => "audience",
            DisplayClass::Stage => "stage",
            DisplayClass::Lobby => "lobby",
        }
    }
}

impl fmt::Display for DisplayClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "audience" => Ok(DisplayClass::Audience),
            "stage" => Ok(DisplayClass::Stage),
            "lobby" => Ok(DisplayClass::Lobby),
            other => Err(CoreError::UnknownDisplayClass(other.to_string())),
        }
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Leader election priority: `(role_weight, start_timestamp)`.
///
/// ## Ordering
/// `Ord` is arranged so that the *greater* priority is the better leader:
/// a higher role weight wins, and for equal weights the earlier start time
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Priority {
    /// Weight of the peer's role (controller 2, display 1).
    pub role_weight: u8,
    /// Process start time in Unix milliseconds.
    pub start_timestamp: i64,
}

impl Priority {
    /// Creates the priority for a role started at `start_timestamp` (ms).
    pub const fn new(role: PeerRole, start_timestamp: i64) -> Self {
        Priority {
            role_weight: role.weight(),
            start_timestamp,
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.role_weight
            .cmp(&other.role_weight)
            .then_with(|| other.start_timestamp.cmp(&self.start_timestamp))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Peer Identity
// =============================================================================

/// Identity of one synchronization participant. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PeerIdentity {
    id: PeerId,
    role: PeerRole,
    display_name: String,
    priority: Priority,
}

impl PeerIdentity {
    /// Creates an identity for a process started at `started_at`.
    pub fn new(
        id: impl Into<PeerId>,
        role: PeerRole,
        display_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        PeerIdentity {
            id: id.into(),
            role,
            display_name: display_name.into(),
            priority: Priority::new(role, started_at.timestamp_millis()),
        }
    }

    /// Rebuilds an identity announced by a remote peer.
    pub fn from_parts(
        id: impl Into<PeerId>,
        role: PeerRole,
        display_name: impl Into<String>,
        priority: Priority,
    ) -> Self {
        PeerIdentity {
            id: id.into(),
            role,
            display_name: display_name.into(),
            priority,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

// =============================================================================
// Peer Info / Leader Status
// =============================================================================

/// One entry of a `peerList` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub role: PeerRole,
    pub display_name: String,
    pub is_connected: bool,
    pub is_leader: bool,
}

/// Leader designation as seen by the local peer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LeaderStatus {
    /// Current leader, if any peer is connected (including ourselves).
    pub leader_id: Option<PeerId>,
    /// Whether the local peer is the leader.
    pub am_i_leader: bool,
    /// Number of connected members, the local peer included.
    pub peer_count: usize,
}

// =============================================================================
// Device Descriptor
// =============================================================================

/// What a display device tells the world about itself when advertising or
/// entering pairing mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DeviceDescriptor {
    /// Display id (peer id of the display process).
    pub display_id: String,
    /// Device hosting the display. One device may host several displays.
    pub device_id: String,
    /// Human readable name.
    pub name: String,
    /// Host the display is reachable at.
    pub host: String,
    /// Port of the display's WebSocket endpoint.
    pub port: u16,
    /// Operating system / platform tag (e.g. "linux", "windows").
    pub platform: String,
    /// Screen resolution, e.g. "1920x1080".
    pub resolution: Option<String>,
}

// =============================================================================
// Pairing Record
// =============================================================================

/// Pending pairing: a code shown on a display, waiting to be confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PairingRecord {
    /// Six character pairing code.
    pub code: String,
    /// Organization the display will be bound to.
    pub org_id: String,
    pub display_id: String,
    pub device_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub platform: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub expires_at: DateTime<Utc>,
}

impl PairingRecord {
    /// Creates a record for `device` valid for `ttl` from `now`.
    pub fn new(
        code: impl Into<String>,
        org_id: impl Into<String>,
        device: &DeviceDescriptor,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        PairingRecord {
            code: code.into(),
            org_id: org_id.into(),
            display_id: device.display_id.clone(),
            device_id: device.device_id.clone(),
            name: device.name.clone(),
            host: device.host.clone(),
            port: device.port,
            platform: device.platform.clone(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A record is usable strictly before its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// =============================================================================
// Registered Display
// =============================================================================

/// Durable binding of a display to an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RegisteredDisplay {
    /// Primary key.
    pub display_id: String,
    pub org_id: String,
    pub device_id: String,
    pub name: String,
    pub class: DisplayClass,
    /// Last known host.
    pub host: String,
    /// Last known port.
    pub port: u16,
    pub platform: String,
    #[ts(as = "String")]
    pub last_seen_at: DateTime<Utc>,
    /// Stored flag, maintained by heartbeats (true) and stale sweeps (false).
    pub online: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl RegisteredDisplay {
    /// Builds the registry entry for a freshly confirmed pairing.
    pub fn from_pairing(
        record: &PairingRecord,
        class: DisplayClass,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        RegisteredDisplay {
            display_id: record.display_id.clone(),
            org_id: record.org_id.clone(),
            device_id: record.device_id.clone(),
            name: name.unwrap_or_else(|| record.name.clone()),
            class,
            host: record.host.clone(),
            port: record.port,
            platform: record.platform.clone(),
            last_seen_at: now,
            online: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived liveness: `now - last_seen_at < stale_window`.
    ///
    /// A `last_seen_at` in the future (clock skew) counts as online.
    pub fn is_online(&self, now: DateTime<Utc>, stale_window: Duration) -> bool {
        match now.signed_duration_since(self.last_seen_at).to_std() {
            Ok(elapsed) => elapsed < stale_window,
            Err(_) => true,
        }
    }
}

// =============================================================================
// Discovered Display
// =============================================================================

/// How a display was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Mdns,
    Udp,
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DiscoveredDisplay {
    /// Display id, when the responder announced one.
    pub display_id: Option<String>,
    pub device_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub platform: String,
    pub resolution: Option<String>,
    pub source: DiscoverySource,
    #[ts(as = "String")]
    pub seen_at: DateTime<Utc>,
}

impl DiscoveredDisplay {
    /// Key used to merge results from several discovery mechanisms.
    pub fn coalesce_key(&self) -> String {
        match &self.display_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// WebSocket endpoint of the display.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn display(last_seen: DateTime<Utc>) -> RegisteredDisplay {
        RegisteredDisplay {
            display_id: "d1".into(),
            org_id: "org".into(),
            device_id: "dev".into(),
            name: "Main".into(),
            class: DisplayClass::Audience,
            host: "10.0.0.2".into(),
            port: 3010,
            platform: "linux".into(),
            last_seen_at: last_seen,
            online: true,
            created_at: last_seen,
            updated_at: last_seen,
        }
    }

    #[test]
    fn test_role_weights() {
        assert_eq!(PeerRole::Controller.weight(), 2);
        assert_eq!(PeerRole::Display.weight(), 1);
        assert_eq!("Controller".parse::<PeerRole>().unwrap(), PeerRole::Controller);
        assert!("projector".parse::<PeerRole>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        let controller_late = Priority::new(PeerRole::Controller, 2_000);
        let display_early = Priority::new(PeerRole::Display, 1_000);
        assert!(controller_late > display_early);

        let early = Priority::new(PeerRole::Display, 1_000);
        let late = Priority::new(PeerRole::Display, 2_000);
        assert!(early > late);
    }

    #[test]
    fn test_is_online_window() {
        let window = Duration::from_secs(30);
        let d = display(at(0));
        assert!(d.is_online(at(29), window));
        assert!(!d.is_online(at(30), window));
        assert!(!d.is_online(at(120), window));
        // Clock skew: seen "in the future"
        assert!(d.is_online(at(-5), window));
    }

    #[test]
    fn test_pairing_record_expiry() {
        let device = DeviceDescriptor {
            display_id: "d1".into(),
            device_id: "dev".into(),
            name: "Lobby TV".into(),
            host: "10.0.0.9".into(),
            port: 3010,
            platform: "linux".into(),
            resolution: None,
        };
        let rec = PairingRecord::new("ABC234", "org", &device, at(0), Duration::from_secs(300));
        assert!(!rec.is_expired(at(299)));
        assert!(rec.is_expired(at(300)));

        let reg = RegisteredDisplay::from_pairing(&rec, DisplayClass::Lobby, None, at(10));
        assert_eq!(reg.name, "Lobby TV");
        assert_eq!(reg.class, DisplayClass::Lobby);
        assert!(reg.online);
    }

    #[test]
    fn test_coalesce_key() {
        let mut found = DiscoveredDisplay {
            display_id: Some("d1".into()),
            device_id: "dev".into(),
            name: "Main".into(),
            host: "10.0.0.2".into(),
            port: 3010,
            platform: "linux".into(),
            resolution: None,
            source: DiscoverySource::Mdns,
            seen_at: at(0),
        };
        assert_eq!(found.coalesce_key(), "d1");
        found.display_id = None;
        assert_eq!(found.coalesce_key(), "10.0.0.2:3010");
        assert_eq!(found.ws_url(), "ws://10.0.0.2:3010/ws");
    }
}
