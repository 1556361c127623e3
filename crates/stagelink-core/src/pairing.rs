//! # Pairing Codes
//!
//! Short, operator-readable codes shown on a display in pairing mode and
//! typed into the controller to bind the display to an organization.
//!
//! ## Format
//! ```text
//!   ┌───┬───┬───┬───┬───┬───┐
//!   │ K │ 7 │ M │ Q │ 2 │ X │   6 symbols
//!   └───┴───┴───┴───┴───┴───┘
//!   alphabet: A-Z 2-9 without O and I   (32 symbols, 32^6 ≈ 1.07e9 codes)
//! ```

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::{PAIRING_ALPHABET, PAIRING_CODE_LENGTH};

/// A validated pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    /// Parses operator input: surrounding whitespace is ignored and lowercase
    /// letters are accepted.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_uppercase();

        if normalized.is_empty() {
            return Err(ValidationError::Required {
                field: "pairing_code".to_string(),
            });
        }

        if normalized.chars().count() != PAIRING_CODE_LENGTH {
            return Err(ValidationError::WrongLength {
                field: "pairing_code".to_string(),
                expected: PAIRING_CODE_LENGTH,
            });
        }

        if let Some(bad) = normalized.chars().find(|c| !PAIRING_ALPHABET.contains(*c)) {
            return Err(ValidationError::InvalidFormat {
                field: "pairing_code".to_string(),
                reason: format!("'{bad}' is not a pairing code symbol"),
            });
        }

        Ok(PairingCode(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PairingCode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PairingCode::parse(s)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PairingCode::parse(&value)
    }
}

impl From<PairingCode> for String {
    fn from(code: PairingCode) -> Self {
        code.0
    }
}

/// Generates a random pairing code using the thread-local RNG.
pub fn generate() -> PairingCode {
    generate_with(&mut rand::rng())
}

/// Generates a pairing code from the given RNG.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> PairingCode {
    let alphabet = PAIRING_ALPHABET.as_bytes();
    let code = (0..PAIRING_CODE_LENGTH)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect();
    PairingCode(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_has_32_unambiguous_symbols() {
        assert_eq!(PAIRING_ALPHABET.len(), 32);
        for c in ['0', 'O', '1', 'I'] {
            assert!(!PAIRING_ALPHABET.contains(c));
        }
    }

    #[test]
    fn test_generated_codes_are_well_formed() {
        for _ in 0..1_000 {
            let code = generate();
            assert_eq!(code.as_str().len(), PAIRING_CODE_LENGTH);
            assert!(code.as_str().chars().all(|c| PAIRING_ALPHABET.contains(c)));
            assert_eq!(PairingCode::parse(code.as_str()).unwrap(), code);
        }
    }

    #[test]
    fn test_parse_normalizes_input() {
        let code = PairingCode::parse("  k7mq2x ").unwrap();
        assert_eq!(code.as_str(), "K7MQ2X");
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert!(matches!(
            PairingCode::parse(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            PairingCode::parse("ABC"),
            Err(ValidationError::WrongLength { .. })
        ));
        assert!(matches!(
            PairingCode::parse("ABC10O"),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_serde_validates() {
        let ok: PairingCode = serde_json::from_str("\"abcdef\"").unwrap();
        assert_eq!(ok.as_str(), "ABCDEF");
        assert!(serde_json::from_str::<PairingCode>("\"ABCDE0\"").is_err());
    }
}
