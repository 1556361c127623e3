//! End-to-end tests over real WebSocket sessions on loopback.

mod common;

use std::sync::Arc;

use stagelink_core::{DisplayClass, PeerRole};
use stagelink_db::{Database, DbConfig};
use stagelink_sync::{
    ConnectionState, ControlMessage, LyricsUpdate, SyncConfig, SyncError, SyncEvent, SyncNode,
    SyncNodeBuilder,
};

use common::{next_message, wait_for};

fn loopback_config(id: &str, role: PeerRole) -> SyncConfig {
    let mut config = SyncConfig::new();
    config.node.id = id.to_string();
    config.node.name = format!("Node {id}");
    config.node.role = role;
    config.organization.id = "grace-church".to_string();
    config.server.bind_addr = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.advertise_host = Some("127.0.0.1".to_string());
    config.discovery.mdns_enabled = false;
    config.discovery.udp_enabled = false;
    config.pairing.confirm_timeout_secs = 1;
    config
}

async fn start(id: &str, role: PeerRole) -> SyncNode {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    SyncNodeBuilder::new(loopback_config(id, role))
        .with_store(Arc::new(db))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn controller_resyncs_display_on_connect() {
    let controller = start("booth", PeerRole::Controller).await;
    let display = start("stage-left", PeerRole::Display).await;

    controller
        .broadcast_lyrics(LyricsUpdate {
            org_id: "grace-church".into(),
            event_id: "sunday".into(),
            song_id: "song-1".into(),
            title: "Be Thou My Vision".into(),
            text: "Be Thou my vision, O Lord of my heart".into(),
            background_url: None,
            target_id: None,
        })
        .await
        .unwrap();

    let mut display_events = display.subscribe();
    let peer_id = controller.connect(&display.local_endpoint()).await.unwrap();
    assert_eq!(peer_id, "stage-left");

    match next_message(&mut display_events, "lyrics").await {
        ControlMessage::Lyrics(payload) => {
            assert_eq!(payload.sender_id, "booth");
            assert_eq!(payload.song_id, "song-1");
            assert_eq!(payload.target_id.as_deref(), Some("stage-left"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let status = display.leader_status().await;
    assert_eq!(status.leader_id.as_deref(), Some("booth"));
    assert!(!status.am_i_leader);

    controller.shutdown().await;
    display.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_peers() {
    let controller = start("booth", PeerRole::Controller).await;
    let display = start("stage-right", PeerRole::Display).await;
    controller.connect(&display.local_endpoint()).await.unwrap();

    let mut events = controller.subscribe();
    display.shutdown().await;
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::ConnectionStateChanged { peer_id, state: ConnectionState::Disconnected } if peer_id == "stage-right")
    })
    .await;

    assert!(controller.connections().await.is_empty());
    assert!(controller.leader_status().await.am_i_leader);
    controller.shutdown().await;
}

#[tokio::test]
async fn pairing_registers_display_for_the_organization() {
    let controller = start("booth", PeerRole::Controller).await;
    let display = start("lobby-1", PeerRole::Display).await;

    let record = controller
        .begin_pairing_for(&display.device_descriptor())
        .await
        .unwrap();
    assert_eq!(record.display_id, "lobby-1");
    assert_eq!(record.port, display.listen_port());

    let registered = controller
        .confirm_pairing(&record.code.to_lowercase(), DisplayClass::Lobby, Some("Foyer".into()))
        .await
        .unwrap();
    assert_eq!(registered.display_id, "lobby-1");
    assert_eq!(registered.class, DisplayClass::Lobby);
    assert_eq!(registered.name, "Foyer");

    let displays = controller.registered_displays().await.unwrap();
    assert_eq!(displays.len(), 1);
    assert!(controller.remove_display("lobby-1").await.unwrap());
    assert!(controller.registered_displays().await.unwrap().is_empty());

    controller.shutdown().await;
    display.shutdown().await;
}

#[tokio::test]
async fn controller_confirms_code_shown_by_display() {
    let controller = start("booth", PeerRole::Controller).await;
    let display = start("lobby-2", PeerRole::Display).await;
    controller.connect(&display.local_endpoint()).await.unwrap();

    let record = display.begin_pairing().await.unwrap();
    assert_eq!(record.display_id, "lobby-2");

    let registered = controller
        .confirm_pairing(&record.code.to_lowercase(), DisplayClass::Stage, None)
        .await
        .unwrap();
    assert_eq!(registered.display_id, "lobby-2");
    assert_eq!(registered.org_id, "grace-church");
    assert_eq!(registered.port, display.listen_port());
    assert_eq!(controller.registered_displays().await.unwrap().len(), 1);

    // Single use on the display side
    assert!(!display.cancel_pairing(&record.code).await.unwrap());
    let again = controller
        .confirm_pairing(&record.code, DisplayClass::Stage, None)
        .await;
    assert!(matches!(again, Err(SyncError::PairingCodeNotFound(_))));

    controller.shutdown().await;
    display.shutdown().await;
}

#[tokio::test]
async fn dropping_a_node_disconnects_its_peers() {
    let controller = start("booth", PeerRole::Controller).await;
    let display = start("balcony", PeerRole::Display).await;
    controller.connect(&display.local_endpoint()).await.unwrap();

    let mut events = controller.subscribe();
    drop(display);
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::ConnectionStateChanged { peer_id, state: ConnectionState::Disconnected } if peer_id == "balcony")
    })
    .await;

    assert!(controller.connections().await.is_empty());
    controller.shutdown().await;
}
