//! # Repository Module
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  stagelink-sync                                                         │
//! │       │                                                                 │
//! │       │  db.displays().touch(org, display, now)                         │
//! │       ▼                                                                 │
//! │  DisplayRepository                     PairingRepository                │
//! │  ├── get_registered_displays           ├── insert                       │
//! │  ├── upsert                            ├── take (one-shot)              │
//! │  ├── touch / update_address            ├── delete                       │
//! │  ├── mark_stale_offline                └── purge_expired                │
//! │  └── remove                                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite (timestamps as Unix milliseconds)                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};

use crate::error::{DbError, DbResult};

pub mod display;
pub mod pairing;

/// Converts a stored millisecond timestamp back into a `DateTime`.
pub(crate) fn from_millis(table: &str, column: &str, ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::corrupt(table, format!("{column} out of range: {ms}")))
}

/// Converts a stored port back into a `u16`.
pub(crate) fn to_port(table: &str, port: i64) -> DbResult<u16> {
    u16::try_from(port).map_err(|_| DbError::corrupt(table, format!("invalid port {port}")))
}
