//! # Attached Screens
//!
//! Reads the EDID of every connected output so a display node can take a
//! stable id from its monitor instead of a random one.
//!
//! ```text
//! /sys/class/drm/
//!   card0/              (skipped: not an output)
//!   card0-HDMI-A-1/edid ──► parse_edid ──► EdidInfo::display_id()
//!   card0-DP-1/edid      (empty when nothing is plugged in)
//! ```

use std::path::Path;

use tracing::{debug, info, warn};

use stagelink_core::fingerprint::{fallback_display_id, parse_edid, EdidInfo};

/// Where the kernel exposes connector state on Linux.
pub const DRM_ROOT: &str = "/sys/class/drm";

/// Decodes the EDID of each connected output under `drm_root`, in connector
/// name order. Outputs with no or unreadable EDID are skipped.
pub fn read_edids(drm_root: &Path) -> Vec<EdidInfo> {
    let entries = match std::fs::read_dir(drm_root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = ?drm_root, error = %e, "No DRM directory");
            return Vec::new();
        }
    };

    let mut connectors: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("card") && n.contains('-'))
        })
        .collect();
    connectors.sort();

    let mut found = Vec::new();
    for connector in connectors {
        let edid_path = connector.join("edid");
        let bytes = match std::fs::read(&edid_path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => continue,
            Err(e) => {
                debug!(path = ?edid_path, error = %e, "EDID not readable");
                continue;
            }
        };
        match parse_edid(&bytes) {
            Ok(edid) => {
                info!(
                    connector = ?connector.file_name(),
                    manufacturer = %edid.manufacturer,
                    model = ?edid.model_name,
                    "Screen detected"
                );
                found.push(edid);
            }
            Err(e) => warn!(path = ?edid_path, error = %e, "Ignoring malformed EDID"),
        }
    }
    found
}

/// Stable id for the primary screen: the first EDID's fingerprint, else one
/// derived from the OS and `resolution` ("WIDTHxHEIGHT").
pub fn local_display_id(drm_root: &Path, resolution: Option<&str>) -> Option<String> {
    if let Some(edid) = read_edids(drm_root).first() {
        return Some(edid.display_id());
    }

    let (width, height) = resolution?.split_once('x')?;
    let width = width.trim().parse().ok()?;
    let height = height.trim().parse().ok()?;
    Some(fallback_display_id(0, std::env::consts::OS, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edid_bytes(serial: u32) -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        edid[8] = 0x10;
        edid[9] = 0xAC;
        edid[10..12].copy_from_slice(&0xA0C5u16.to_le_bytes());
        edid[12..16].copy_from_slice(&serial.to_le_bytes());
        edid
    }

    fn connector(root: &Path, name: &str, edid: &[u8]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("edid"), edid).unwrap();
    }

    #[test]
    fn test_reads_connected_outputs_in_order() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("card0")).unwrap();
        connector(root.path(), "card0-HDMI-A-2", &edid_bytes(2));
        connector(root.path(), "card0-DP-1", &[]);
        connector(root.path(), "card0-HDMI-A-1", &edid_bytes(1));
        connector(root.path(), "card1-VGA-1", b"garbage");

        let edids = read_edids(root.path());
        assert_eq!(edids.len(), 2);
        assert_eq!(edids[0].serial_number, 1);
        assert_eq!(edids[1].serial_number, 2);
        assert_eq!(edids[0].manufacturer, "DEL");
    }

    #[test]
    fn test_local_display_id_prefers_edid() {
        let root = tempfile::tempdir().unwrap();
        connector(root.path(), "card0-HDMI-A-1", &edid_bytes(7));

        let id = local_display_id(root.path(), Some("1920x1080")).unwrap();
        assert_eq!(id, read_edids(root.path())[0].display_id());
        // Same monitor, same id
        assert_eq!(local_display_id(root.path(), None), Some(id));
    }

    #[test]
    fn test_local_display_id_falls_back_to_resolution() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("no-drm");

        let id = local_display_id(&missing, Some("1920x1080")).unwrap();
        assert_eq!(id, fallback_display_id(0, std::env::consts::OS, 1920, 1080));
        assert_eq!(local_display_id(&missing, None), None);
        assert_eq!(local_display_id(&missing, Some("wide")), None);
    }
}
