//! # Node Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STAGELINK_ROLE=display                                             │
//! │     STAGELINK_ORG_ID=grace-church                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/stagelink/node.toml (Linux)                              │
//! │     ~/Library/Application Support/com.stagelink.node/node.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     controller role, generated node id, port 3010                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The node id is generated on first start and must survive restarts, so
//! [`SyncConfig::load_or_init`] writes the file back when it did not exist.
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Sanctuary Left"
//! role = "display"
//! display_class = "audience"
//!
//! [organization]
//! id = "grace-church"
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 3010
//!
//! [discovery]
//! mdns_enabled = true
//! udp_enabled = true
//! udp_port = 48488
//! timeout_secs = 5
//!
//! [liveness]
//! stale_window_secs = 30
//! sweep_interval_secs = 10
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagelink_core::validation::{validate_display_name, validate_org_id, validate_peer_id};
use stagelink_core::{
    DeviceDescriptor, DisplayClass, PeerIdentity, PeerRole, DEFAULT_PAIRING_TTL_SECS,
    DEFAULT_STALE_WINDOW_SECS,
};

use crate::error::{SyncError, SyncResult};
use crate::screen;

/// Default WebSocket port for signaling and control traffic.
pub const DEFAULT_SERVER_PORT: u16 = 3010;

/// Default UDP port for the discovery fallback.
pub const DEFAULT_DISCOVERY_PORT: u16 = 48488;

// =============================================================================
// Node Settings
// =============================================================================

/// Identity of this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Peer id (UUID v4). Generated on first run.
    #[serde(default = "generate_node_id")]
    pub id: String,

    /// Human-readable name shown to operators.
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Controller or display.
    #[serde(default = "default_role")]
    pub role: PeerRole,

    /// Class used when this display pairs itself.
    #[serde(default)]
    pub display_class: DisplayClass,

    /// Device id. Several displays may share one device.
    #[serde(default = "generate_node_id")]
    pub device_id: String,

    /// Platform tag advertised during discovery.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Screen resolution advertised during discovery (e.g. "1920x1080").
    #[serde(default)]
    pub resolution: Option<String>,
}

fn generate_node_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_node_name() -> String {
    "StageLink Node".to_string()
}

fn default_role() -> PeerRole {
    PeerRole::Controller
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            id: generate_node_id(),
            name: default_node_name(),
            role: default_role(),
            display_class: DisplayClass::default(),
            device_id: generate_node_id(),
            platform: default_platform(),
            resolution: None,
        }
    }
}

// =============================================================================
// Organization Settings
// =============================================================================

/// The organization displays are registered to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationSettings {
    #[serde(default = "default_org_id")]
    pub id: String,
}

fn default_org_id() -> String {
    "default-org".to_string()
}

impl Default for OrganizationSettings {
    fn default() -> Self {
        OrganizationSettings {
            id: default_org_id(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Local WebSocket endpoint that peers connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port. 0 picks an ephemeral port.
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Host other peers should use to reach us. Detected when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_server_port(),
            advertise_host: None,
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Display discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Enable mDNS advertisement and browsing.
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,

    /// Enable UDP broadcast discovery (fallback for networks that drop
    /// multicast).
    #[serde(default = "default_true")]
    pub udp_enabled: bool,

    /// UDP discovery port.
    #[serde(default = "default_discovery_port")]
    pub udp_port: u16,

    /// Destination of UDP scan requests.
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,

    /// Default scan timeout (seconds).
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,

    /// Advertise this node when it is a display.
    #[serde(default = "default_true")]
    pub advertise: bool,
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}

fn default_discovery_timeout() -> u64 {
    5
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            mdns_enabled: true,
            udp_enabled: true,
            udp_port: default_discovery_port(),
            broadcast_addr: default_broadcast_addr(),
            timeout_secs: default_discovery_timeout(),
            advertise: true,
        }
    }
}

impl DiscoverySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Liveness Settings
// =============================================================================

/// Heartbeat and staleness settings.
///
/// ```text
///   heartbeat ─┐    ┌─ heartbeat        silence ≥ stale_window
///              ▼    ▼                          │
///   ───────────●────●──────────────────────────┼───── sweep ──► offline
///                   └──────── stale_window ────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessSettings {
    /// Heartbeat period. Defaults to 5s for controllers and 10s for displays.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,

    /// Silence after which a display is considered offline.
    #[serde(default = "default_stale_window")]
    pub stale_window_secs: u64,

    /// Period of the stale sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_stale_window() -> u64 {
    DEFAULT_STALE_WINDOW_SECS
}

fn default_sweep_interval() -> u64 {
    10
}

impl Default for LivenessSettings {
    fn default() -> Self {
        LivenessSettings {
            heartbeat_interval_secs: None,
            stale_window_secs: default_stale_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LivenessSettings {
    /// Heartbeat period for a peer of `role`.
    pub fn heartbeat_interval(&self, role: PeerRole) -> Duration {
        let secs = self.heartbeat_interval_secs.unwrap_or(match role {
            PeerRole::Controller => 5,
            PeerRole::Display => 10,
        });
        Duration::from_secs(secs)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Deadlines and buffers for peer sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Opening a transport session (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Exchanging `register` messages (seconds).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Completing an offer/answer/candidate exchange (seconds).
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Outgoing message buffer per connection.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_negotiation_timeout() -> u64 {
    15
}

fn default_channel_buffer() -> usize {
    256
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

// =============================================================================
// Pairing / Content / Database Settings
// =============================================================================

/// Pairing mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Validity window of a pairing code (seconds).
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,

    /// Attempts at finding an unused code before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long a controller waits for the display holding a code to
    /// answer (seconds).
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

fn default_code_ttl() -> u64 {
    DEFAULT_PAIRING_TTL_SECS
}

fn default_max_attempts() -> u32 {
    8
}

fn default_confirm_timeout() -> u64 {
    5
}

impl Default for PairingSettings {
    fn default() -> Self {
        PairingSettings {
            code_ttl_secs: default_code_ttl(),
            max_attempts: default_max_attempts(),
            confirm_timeout_secs: default_confirm_timeout(),
        }
    }
}

impl PairingSettings {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

/// Precache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSettings {
    /// Lifetime of signed media URLs handed to displays (seconds).
    #[serde(default = "default_media_url_ttl")]
    pub media_url_ttl_secs: u64,
}

fn default_media_url_ttl() -> u64 {
    6 * 60 * 60
}

impl Default for ContentSettings {
    fn default() -> Self {
        ContentSettings {
            media_url_ttl_secs: default_media_url_ttl(),
        }
    }
}

impl ContentSettings {
    pub fn media_url_ttl(&self) -> Duration {
        Duration::from_secs(self.media_url_ttl_secs)
    }
}

/// Registry database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub organization: OrganizationSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub liveness: LivenessSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub pairing: PairingSettings,

    #[serde(default)]
    pub content: ContentSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated node id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (node.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let (config, _) = Self::load_inner(config_path)?;
        Ok(config)
    }

    /// Like [`SyncConfig::load`], and writes the file when it did not exist
    /// so the generated node id persists. A new display takes its id from
    /// the attached screen unless `STAGELINK_NODE_ID` sets one.
    pub fn load_or_init(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = config_path.or_else(Self::default_config_path);
        let (mut config, existed) = Self::load_inner(path.clone())?;

        if !existed {
            if std::env::var_os("STAGELINK_NODE_ID").is_none() {
                config.adopt_screen_id(Path::new(screen::DRM_ROOT));
            }
            match path {
                Some(path) => config.save(Some(path))?,
                None => warn!("No config directory available; node id will not persist"),
            }
        }

        Ok(config)
    }

    fn load_inner(config_path: Option<PathBuf>) -> SyncResult<(Self, bool)> {
        let mut config = Self::default();
        let mut existed = false;

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading node config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
                existed = true;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok((config, existed))
    }

    /// Replaces a display's node id with the fingerprint of its screen
    /// under `drm_root`. Controllers keep theirs. Returns whether it changed.
    pub fn adopt_screen_id(&mut self, drm_root: &Path) -> bool {
        if self.node.role != PeerRole::Display {
            return false;
        }
        match screen::local_display_id(drm_root, self.node.resolution.as_deref()) {
            Some(id) if id != self.node.id => {
                info!(node_id = %id, "Using screen fingerprint as node id");
                self.node.id = id;
                true
            }
            _ => false,
        }
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load node config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Node config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_peer_id(&self.node.id)?;
        validate_display_name(&self.node.name)?;
        validate_org_id(&self.organization.id)?;

        if self.server.bind_addr.parse::<IpAddr>().is_err() {
            return Err(SyncError::InvalidConfig(format!(
                "server.bind_addr is not an IP address: {}",
                self.server.bind_addr
            )));
        }

        if self.discovery.broadcast_addr.parse::<IpAddr>().is_err() {
            return Err(SyncError::InvalidConfig(format!(
                "discovery.broadcast_addr is not an IP address: {}",
                self.discovery.broadcast_addr
            )));
        }

        if self.discovery.udp_port == 0 {
            return Err(SyncError::InvalidConfig(
                "discovery.udp_port must be greater than 0".into(),
            ));
        }

        if self.liveness.stale_window_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "liveness.stale_window_secs must be greater than 0".into(),
            ));
        }

        if self.liveness.heartbeat_interval(self.node.role) >= self.liveness.stale_window() {
            return Err(SyncError::InvalidConfig(
                "heartbeat interval must be shorter than the stale window".into(),
            ));
        }

        let zero_timeouts = [
            ("connection.connect_timeout_secs", self.connection.connect_timeout_secs),
            ("connection.handshake_timeout_secs", self.connection.handshake_timeout_secs),
            ("connection.negotiation_timeout_secs", self.connection.negotiation_timeout_secs),
            ("discovery.timeout_secs", self.discovery.timeout_secs),
            ("liveness.sweep_interval_secs", self.liveness.sweep_interval_secs),
            ("pairing.code_ttl_secs", self.pairing.code_ttl_secs),
            ("pairing.confirm_timeout_secs", self.pairing.confirm_timeout_secs),
        ];
        if let Some((name, _)) = zero_timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::InvalidConfig(format!("{name} must be greater than 0")));
        }

        if self.connection.channel_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "connection.channel_buffer must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `STAGELINK_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("STAGELINK_NODE_ID") {
            debug!(node_id = %id, "Overriding node id from environment");
            self.node.id = id;
        }

        if let Some(name) = lookup("STAGELINK_NODE_NAME") {
            self.node.name = name;
        }

        if let Some(role) = lookup("STAGELINK_ROLE") {
            match role.parse() {
                Ok(parsed) => self.node.role = parsed,
                Err(_) => warn!(role = %role, "Unknown role in environment"),
            }
        }

        if let Some(class) = lookup("STAGELINK_DISPLAY_CLASS") {
            match class.parse() {
                Ok(parsed) => self.node.display_class = parsed,
                Err(_) => warn!(class = %class, "Unknown display class in environment"),
            }
        }

        if let Some(org) = lookup("STAGELINK_ORG_ID") {
            self.organization.id = org;
        }

        if let Some(port) = lookup("STAGELINK_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding server port from environment");
                self.server.port = p;
            }
        }

        if let Some(addr) = lookup("STAGELINK_BIND_ADDR") {
            self.server.bind_addr = addr;
        }

        if let Some(host) = lookup("STAGELINK_ADVERTISE_HOST") {
            self.server.advertise_host = Some(host);
        }

        if let Some(port) = lookup("STAGELINK_DISCOVERY_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.discovery.udp_port = p;
            }
        }

        if let Some(secs) = lookup("STAGELINK_STALE_WINDOW_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.liveness.stale_window_secs = s;
            }
        }

        if let Some(path) = lookup("STAGELINK_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "stagelink", "node")
            .map(|dirs| dirs.config_dir().join("node.toml"))
    }

    /// Returns the database path, falling back to the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "stagelink", "node")
                .map(|dirs| dirs.data_dir().join("stagelink.db"))
                .unwrap_or_else(|| PathBuf::from("stagelink.db"))
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the node id.
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Returns the organization id.
    pub fn org_id(&self) -> &str {
        &self.organization.id
    }

    /// Builds this process's identity for a start at `started_at`.
    pub fn identity(&self, started_at: DateTime<Utc>) -> PeerIdentity {
        PeerIdentity::new(
            self.node.id.clone(),
            self.node.role,
            self.node.name.clone(),
            started_at,
        )
    }

    /// Describes this node as a display reachable at `host:port`.
    pub fn device_descriptor(&self, host: impl Into<String>, port: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            display_id: self.node.id.clone(),
            device_id: self.node.device_id.clone(),
            name: self.node.name.clone(),
            host: host.into(),
            port,
            platform: self.node.platform.clone(),
            resolution: self.node.resolution.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.node.id.is_empty());
        assert_eq!(config.node.role, PeerRole::Controller);
        assert_eq!(config.server.port, 3010);
        assert_eq!(config.discovery.udp_port, 48488);
        assert_eq!(config.liveness.stale_window(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_display_adopts_screen_fingerprint() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.node.resolution = Some("1280x720".into());

        // Controllers keep their generated id
        let generated = config.node.id.clone();
        assert!(!config.adopt_screen_id(root.path()));
        assert_eq!(config.node.id, generated);

        config.node.role = PeerRole::Display;
        assert!(config.adopt_screen_id(root.path()));
        assert_eq!(
            config.node.id,
            stagelink_core::fingerprint::fallback_display_id(0, std::env::consts::OS, 1280, 720)
        );
        assert!(config.validate().is_ok());

        // Already adopted
        assert!(!config.adopt_screen_id(root.path()));
    }

    #[test]
    fn test_heartbeat_interval_depends_on_role() {
        let liveness = LivenessSettings::default();
        assert_eq!(liveness.heartbeat_interval(PeerRole::Controller), Duration::from_secs(5));
        assert_eq!(liveness.heartbeat_interval(PeerRole::Display), Duration::from_secs(10));

        let fixed = LivenessSettings {
            heartbeat_interval_secs: Some(2),
            ..LivenessSettings::default()
        };
        assert_eq!(fixed.heartbeat_interval(PeerRole::Display), Duration::from_secs(2));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.organization.id = String::new();
        assert!(config.validate().is_err());
        config.organization.id = "org".into();

        config.liveness.heartbeat_interval_secs = Some(30);
        assert!(config.validate().is_err());
        config.liveness.heartbeat_interval_secs = None;

        config.discovery.broadcast_addr = "everyone".into();
        assert!(config.validate().is_err());
        config.discovery.broadcast_addr = "192.168.1.255".into();

        config.connection.handshake_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.connection.handshake_timeout_secs = 5;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STAGELINK_ROLE", "display"),
            ("STAGELINK_ORG_ID", "grace-church"),
            ("STAGELINK_PORT", "4010"),
            ("STAGELINK_DISPLAY_CLASS", "stage"),
            ("STAGELINK_DISCOVERY_PORT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.node.role, PeerRole::Display);
        assert_eq!(config.org_id(), "grace-church");
        assert_eq!(config.server.port, 4010);
        assert_eq!(config.node.display_class, DisplayClass::Stage);
        assert_eq!(config.discovery.udp_port, DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn test_toml_partial_file() {
        let config: SyncConfig = toml::from_str(
            r#"
            [node]
            id = "node-1"
            role = "display"

            [liveness]
            stale_window_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id(), "node-1");
        assert_eq!(config.node.role, PeerRole::Display);
        assert_eq!(config.liveness.stale_window_secs, 45);
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn test_load_or_init_persists_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let first = SyncConfig::load_or_init(Some(path.clone())).unwrap();
        assert!(path.exists());

        let second = SyncConfig::load_or_init(Some(path)).unwrap();
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.node.device_id, second.node.device_id);
    }

    #[test]
    fn test_identity_priority() {
        let mut config = SyncConfig::default();
        config.node.role = PeerRole::Display;
        let started = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let identity = config.identity(started);
        assert_eq!(identity.priority().role_weight, 1);
        assert_eq!(identity.priority().start_timestamp, 1_700_000_000_000);
    }
}
