//! # Display Fingerprinting
//!
//! Derives a stable display id from a monitor's EDID so a physical screen
//! keeps its registry entry across reinstalls and cable swaps.
//!
//! ## EDID Base Block (first 128 bytes)
//! ```text
//!  offset  size  field
//!  ──────  ────  ───────────────────────────────────────────────
//!     0      8   header 00 FF FF FF FF FF FF 00
//!     8      2   manufacturer id (3 × 5-bit letters, big-endian)
//!    10      2   product code (little-endian)
//!    12      4   serial number (little-endian)
//!    16      1   week of manufacture
//!    17      1   year of manufacture - 1990
//!    21      1   max horizontal size (cm)
//!    22      1   max vertical size (cm)
//!    54     18   descriptor 1 ┐
//!    72     18   descriptor 2 │ tag 0xFC at +3 = monitor name,
//!    90     18   descriptor 3 │ text at +5..+18, ends at 0x0A
//!   108     18   descriptor 4 ┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
const EDID_BLOCK_LEN: usize = 128;
const DESCRIPTOR_OFFSETS: [usize; 4] = [54, 72, 90, 108];
const MONITOR_NAME_TAG: u8 = 0xFC;

/// Identity facts decoded from an EDID block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdidInfo {
    /// Three letter PNP id, e.g. "DEL".
    pub manufacturer: String,
    pub product_code: u16,
    pub serial_number: u32,
    pub week: u8,
    pub year: u16,
    pub width_cm: u8,
    pub height_cm: u8,
    /// Monitor name descriptor, if present.
    pub model_name: Option<String>,
}

impl EdidInfo {
    /// Deterministic display id for this monitor.
    pub fn display_id(&self) -> String {
        let key = format!(
            "{}:{}:{}:{}",
            self.manufacturer,
            self.product_code,
            self.serial_number,
            self.model_name.as_deref().unwrap_or("")
        );
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, key.as_bytes()).to_string()
    }
}

/// Decodes the base block of an EDID blob.
pub fn parse_edid(bytes: &[u8]) -> CoreResult<EdidInfo> {
    if bytes.len() < EDID_BLOCK_LEN {
        return Err(CoreError::InvalidEdid(format!(
            "expected at least {EDID_BLOCK_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[..8] != EDID_HEADER {
        return Err(CoreError::InvalidEdid("bad header".to_string()));
    }

    Ok(EdidInfo {
        manufacturer: decode_manufacturer(u16::from_be_bytes([bytes[8], bytes[9]])),
        product_code: u16::from_le_bytes([bytes[10], bytes[11]]),
        serial_number: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        week: bytes[16],
        year: 1990 + u16::from(bytes[17]),
        width_cm: bytes[21],
        height_cm: bytes[22],
        model_name: monitor_name(bytes),
    })
}

/// Decodes the packed PNP manufacturer id.
pub fn decode_manufacturer(raw: u16) -> String {
    [10u16, 5, 0]
        .iter()
        .map(|shift| {
            let letter = ((raw >> shift) & 0x1F) as u8;
            (b'A' + letter.saturating_sub(1)) as char
        })
        .collect()
}

fn monitor_name(bytes: &[u8]) -> Option<String> {
    DESCRIPTOR_OFFSETS.iter().find_map(|&offset| {
        let desc = &bytes[offset..offset + 18];
        if desc[0] != 0 || desc[1] != 0 || desc[3] != MONITOR_NAME_TAG {
            return None;
        }
        let text = &desc[5..18];
        let end = text.iter().position(|&b| b == 0x0A).unwrap_or(text.len());
        let name = String::from_utf8_lossy(&text[..end]).trim().to_string();
        (!name.is_empty()).then_some(name)
    })
}

/// Display id for a screen without readable EDID.
///
/// Stable only as long as the OS keeps the same output order, name and mode.
pub fn fallback_display_id(index: usize, os_name: &str, width: u32, height: u32) -> String {
    let key = format!("fallback:{index}:{os_name}:{width}x{height}");
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, key.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_edid() -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[..8].copy_from_slice(&EDID_HEADER);
        edid[8] = 0x10;
        edid[9] = 0xAC; // DEL
        edid[10..12].copy_from_slice(&0xA0C5u16.to_le_bytes());
        edid[12..16].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        edid[16] = 12;
        edid[17] = 31; // 2021
        edid[21] = 60;
        edid[22] = 34;
        // descriptor 2 carries the monitor name
        edid[72 + 3] = MONITOR_NAME_TAG;
        let name = b"DELL U2720Q\n ";
        edid[72 + 5..72 + 5 + name.len()].copy_from_slice(name);
        edid
    }

    #[test]
    fn test_decode_manufacturer() {
        assert_eq!(decode_manufacturer(0x10AC), "DEL");
        assert_eq!(decode_manufacturer(0x4C2D), "SAM");
    }

    #[test]
    fn test_parse_edid() {
        let info = parse_edid(&sample_edid()).unwrap();
        assert_eq!(info.manufacturer, "DEL");
        assert_eq!(info.product_code, 0xA0C5);
        assert_eq!(info.serial_number, 0x1234_5678);
        assert_eq!(info.week, 12);
        assert_eq!(info.year, 2021);
        assert_eq!((info.width_cm, info.height_cm), (60, 34));
        assert_eq!(info.model_name.as_deref(), Some("DELL U2720Q"));
    }

    #[test]
    fn test_display_id_is_stable() {
        let a = parse_edid(&sample_edid()).unwrap().display_id();
        let b = parse_edid(&sample_edid()).unwrap().display_id();
        assert_eq!(a, b);

        let mut other = sample_edid();
        other[12] ^= 0xFF;
        assert_ne!(a, parse_edid(&other).unwrap().display_id());
    }

    #[test]
    fn test_rejects_short_or_headerless_blocks() {
        assert!(parse_edid(&[0u8; 64]).is_err());
        let mut bad = sample_edid();
        bad[0] = 0xFF;
        assert!(parse_edid(&bad).is_err());
    }

    #[test]
    fn test_fallback_id_is_deterministic() {
        let a = fallback_display_id(0, "HDMI-1", 1920, 1080);
        assert_eq!(a, fallback_display_id(0, "HDMI-1", 1920, 1080));
        assert_ne!(a, fallback_display_id(1, "HDMI-1", 1920, 1080));
    }
}
