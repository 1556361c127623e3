//! # stagelink-core: Pure Types and Algorithms for StageLink
//!
//! Everything in this crate is deterministic (or, for pairing codes, merely
//! random) and free of I/O. The async subsystem in `stagelink-sync` and the
//! registry in `stagelink-db` build on these types.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        StageLink Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Operator UI (controller / display)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ SyncNode API + SyncEvent stream        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                       stagelink-sync                             │   │
//! │  │   discovery • connections • signaling • broadcast • liveness     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ stagelink-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  pairing  │  │ election  │  │fingerprint│  │   │
//! │  │   │ PeerInfo  │  │   codes   │  │  select_  │  │   EDID    │  │   │
//! │  │   │ Display   │  │           │  │  leader   │  │  parsing  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 stagelink-db (display registry)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Peer, display and pairing types
//! - [`pairing`] - Pairing code generation and parsing
//! - [`election`] - Deterministic leader selection
//! - [`fingerprint`] - EDID parsing and stable display ids
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use stagelink_core::pairing::generate;
//! use stagelink_core::{PAIRING_ALPHABET, PAIRING_CODE_LENGTH};
//!
//! let code = generate();
//! assert_eq!(code.as_str().len(), PAIRING_CODE_LENGTH);
//! assert!(code.as_str().chars().all(|c| PAIRING_ALPHABET.contains(c)));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod election;
pub mod error;
pub mod fingerprint;
pub mod pairing;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use pairing::PairingCode;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Symbols a pairing code may contain.
///
/// 32 symbols: uppercase letters and digits minus the easily confused
/// `0`/`O` and `1`/`I`.
pub const PAIRING_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of characters in a pairing code.
pub const PAIRING_CODE_LENGTH: usize = 6;

/// Default window after which a silent display is considered offline.
pub const DEFAULT_STALE_WINDOW_SECS: u64 = 30;

/// Default validity of a pairing code.
pub const DEFAULT_PAIRING_TTL_SECS: u64 = 300;
