//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Discovery     │  │      Transport          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │ DiscoveryFailed │  │  ConnectionFailed       │ │
//! │  │  InvalidUrl     │  │ AdvertiseFailed │  │  Disconnected, Timeout  │ │
//! │  │  ConfigLoad/Save│  │                 │  │  WebSocketError         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Negotiation    │  │    Protocol     │  │      Registry           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │NegotiationFailed│  │  InvalidMessage │  │  PeerNotConnected       │ │
//! │  │  NoRendezvous   │  │  HandshakeFailed│  │  SelfConnection         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Pairing      │  │    Content      │  │   Database / Internal   │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  CodeNotFound   │  │  Content        │  │  DatabaseError          │ │
//! │  │  Expired        │  │  Unavailable    │  │  ChannelError           │ │
//! │  │  CodeExhausted  │  │                 │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type covering every failure of the synchronization subsystem.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    /// No discovery mechanism could be started. An empty scan is not an error.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The local display could not be advertised.
    #[error("Advertisement failed: {0}")]
    AdvertiseFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to open a session with a peer.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel to a peer closed.
    #[error("Disconnected from peer")]
    Disconnected,

    /// A network operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// The local WebSocket server could not be started.
    #[error("Server failed: {0}")]
    ServerFailed(String),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    // =========================================================================
    // Negotiation Errors
    // =========================================================================
    /// Offer/answer/candidate exchange with a peer did not complete.
    #[error("Negotiation with {peer_id} failed: {reason}")]
    NegotiationFailed { peer_id: String, reason: String },

    /// No connected peer can relay negotiation messages.
    #[error("No rendezvous peer available")]
    NoRendezvous,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Unexpected message type.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    /// Register exchange did not complete.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// No live connection to the addressed peer.
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// The remote endpoint turned out to be ourselves.
    #[error("Refusing to connect to self")]
    SelfConnection,

    // =========================================================================
    // Pairing Errors
    // =========================================================================
    /// No pending pairing with this code in the organization.
    #[error("Pairing code not found: {0}")]
    PairingCodeNotFound(String),

    /// The pairing code existed but its validity window has passed.
    #[error("Pairing code expired: {0}")]
    PairingExpired(String),

    /// Could not find a free code after several attempts.
    #[error("No free pairing code after {attempts} attempts")]
    PairingCodeExhausted { attempts: u32 },

    /// Operator input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Content Errors
    // =========================================================================
    /// The content collaborator could not provide an item.
    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Registry storage failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The node is shutting down.
    #[error("Sync node is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl SyncError {
    /// Creates a Timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Creates a NegotiationFailed error.
    pub fn negotiation(peer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::NegotiationFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<stagelink_db::DbError> for SyncError {
    fn from(err: stagelink_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<stagelink_core::CoreError> for SyncError {
    fn from(err: stagelink_core::CoreError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<stagelink_core::ValidationError> for SyncError {
    fn from(err: stagelink_core::ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<mdns_sd::Error> for SyncError {
    fn from(err: mdns_sd::Error) -> Self {
        SyncError::DiscoveryFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the same operation may succeed if the caller tries
    /// again. Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout { .. }
                | SyncError::WebSocketError(_)
                | SyncError::NegotiationFailed { .. }
                | SyncError::NoRendezvous
                | SyncError::DiscoveryFailed(_)
                | SyncError::PairingCodeExhausted { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
                | SyncError::HandshakeFailed(_)
        )
    }

    /// Returns true if the fault concerns a single peer and must not take
    /// the rest of the subsystem down with it.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout { .. }
                | SyncError::WebSocketError(_)
                | SyncError::TlsError(_)
                | SyncError::NegotiationFailed { .. }
                | SyncError::HandshakeFailed(_)
                | SyncError::PeerNotConnected(_)
                | SyncError::SelfConnection
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::timeout("connect", Duration::from_secs(5)).is_retryable());
        assert!(SyncError::negotiation("peer-1", "no answer").is_retryable());

        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::PairingExpired("ABC234".into()).is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(SyncError::HandshakeFailed("x".into()).is_protocol_error());
        assert!(SyncError::PeerNotConnected("p".into()).is_peer_local());
        assert!(!SyncError::DiscoveryFailed("x".into()).is_peer_local());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::timeout("handshake", Duration::from_secs(10));
        assert_eq!(err.to_string(), "handshake timed out after 10s");

        let err = SyncError::negotiation("peer-9", "answer never arrived");
        assert!(err.to_string().contains("peer-9"));
    }

    #[test]
    fn test_db_error_conversion() {
        let err: SyncError = stagelink_db::DbError::PoolExhausted.into();
        assert!(matches!(err, SyncError::DatabaseError(_)));
    }
}
