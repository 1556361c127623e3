//! # stagelink-db: Display Registry for StageLink
//!
//! Durable storage for the two things that must survive a restart: which
//! displays belong to an organization, and which pairing codes are pending.
//! Liveness itself is derived from `last_seen_at`; this crate only stores it.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        StageLink Data Flow                              │
//! │                                                                         │
//! │  stagelink-sync (PairingService, LivenessMonitor)                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   stagelink-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│ DisplayRepository  │  │ (embedded) │  │   │
//! │  │   │  SqlitePool   │    │ PairingRepository  │  │ 001_*.sql  │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (config dir)/stagelink.db                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagelink_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("stagelink.db")).await?;
//! let displays = db.displays().get_registered_displays("grace-church").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::display::DisplayRepository;
pub use repository::pairing::PairingRepository;
