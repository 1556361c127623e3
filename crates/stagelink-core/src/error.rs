//! # Error Types
//!
//! Domain-specific error types for stagelink-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stagelink-core errors (this file)                                      │
//! │  ├── CoreError        - Domain rule failures                            │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  stagelink-db errors                                                    │
//! │  └── DbError          - Registry persistence failures                   │
//! │                                                                         │
//! │  stagelink-sync errors                                                  │
//! │  └── SyncError        - Discovery, transport, negotiation, pairing      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → operator UI            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An EDID block could not be decoded.
    ///
    /// ## When This Occurs
    /// - Fewer than 128 bytes were supplied
    /// - The fixed 8-byte header is wrong (not an EDID block at all)
    #[error("Invalid EDID: {0}")]
    InvalidEdid(String),

    /// A role string did not name a known peer role.
    #[error("Unknown peer role: {0}")]
    UnknownRole(String),

    /// A display class string did not name a known class.
    #[error("Unknown display class: {0}")]
    UnknownDisplayClass(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value has the wrong length.
    #[error("{field} must be exactly {expected} characters")]
    WrongLength { field: String, expected: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., disallowed characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
