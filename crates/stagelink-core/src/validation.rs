//! # Validation Module
//!
//! Input validation for operator-supplied values (names, org ids, hosts).
//! Pairing codes validate themselves in [`crate::pairing::PairingCode::parse`].
//!
//! ## Usage
//! ```rust
//! use stagelink_core::validation::{validate_display_name, validate_org_id};
//!
//! assert_eq!(validate_display_name("  Stage Left ").unwrap(), "Stage Left");
//! assert!(validate_org_id("").is_err());
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_ID_LEN: usize = 128;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a display or peer name.
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most 100 characters
///
/// ## Returns
/// The trimmed name.
pub fn validate_display_name(name: &str) -> ValidationResult<String> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "display_name".to_string(),
        });
    }

    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "display_name".to_string(),
            max: MAX_DISPLAY_NAME_LEN,
        });
    }

    Ok(name.to_string())
}

/// Validates an organization id.
pub fn validate_org_id(org_id: &str) -> ValidationResult<()> {
    validate_identifier("org_id", org_id)
}

/// Validates a peer / display id.
pub fn validate_peer_id(peer_id: &str) -> ValidationResult<()> {
    validate_identifier("peer_id", peer_id)
}

fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LEN,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers, '-', '_', ':' and '.'".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a TCP/UDP port (zero is reserved for "pick any" and rejected).
pub fn validate_port(field: &str, port: u16) -> ValidationResult<()> {
    if port == 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 1,
            max: i64::from(u16::MAX),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        assert_eq!(validate_display_name(" Lobby ").unwrap(), "Lobby");
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(validate_org_id("grace-church").is_ok());
        assert!(validate_peer_id("6f1c2a9e-7b55-4a53-9d0e-4f2b5bb1b0a1").is_ok());
        assert!(validate_org_id("org id").is_err());
        assert!(validate_peer_id("").is_err());
    }

    #[test]
    fn test_port() {
        assert!(validate_port("port", 3010).is_ok());
        assert!(validate_port("port", 0).is_err());
    }
}
