use std::time::{Duration, Instant};

use stagelink_core::{DeviceDescriptor, DiscoverySource, PeerRole};
use stagelink_sync::config::DiscoverySettings;
use stagelink_sync::discovery::{advertise, scan};

fn udp_only(port: u16) -> DiscoverySettings {
    DiscoverySettings {
        mdns_enabled: false,
        udp_enabled: true,
        udp_port: port,
        broadcast_addr: "127.0.0.1".to_string(),
        ..DiscoverySettings::default()
    }
}

#[tokio::test]
async fn udp_scan_finds_advertised_display() {
    let device = DeviceDescriptor {
        display_id: "display-lobby".into(),
        device_id: "device-7".into(),
        name: "Lobby Screen".into(),
        host: "127.0.0.1".into(),
        port: 3010,
        platform: "linux".into(),
        resolution: Some("1920x1080".into()),
    };

    let mut advertisement = advertise(&udp_only(0), &device, PeerRole::Display)
        .await
        .unwrap();
    let port = advertisement.udp_addr().unwrap().port();

    let found = scan(&udp_only(port), Duration::from_millis(500)).await.unwrap();
    assert_eq!(found.len(), 1);
    let display = &found[0];
    assert_eq!(display.display_id.as_deref(), Some("display-lobby"));
    assert_eq!(display.name, "Lobby Screen");
    assert_eq!(display.host, "127.0.0.1");
    assert_eq!(display.port, 3010);
    assert_eq!(display.resolution.as_deref(), Some("1920x1080"));
    assert_eq!(display.source, DiscoverySource::Udp);

    advertisement.shutdown();
    assert!(!advertisement.is_active());
}

#[tokio::test]
async fn scan_with_nobody_answering_is_empty() {
    // Bound but silent
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let started = Instant::now();
    let found = scan(&udp_only(port), Duration::from_millis(300)).await.unwrap();

    assert!(found.is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn scan_with_no_mechanism_enabled_is_empty() {
    let settings = DiscoverySettings {
        mdns_enabled: false,
        udp_enabled: false,
        ..DiscoverySettings::default()
    };
    let found = scan(&settings, Duration::from_millis(100)).await.unwrap();
    assert!(found.is_empty());
}
