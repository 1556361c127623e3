//! Redeeming a display-issued pairing code from a controller over a session.

mod common;

use std::sync::Arc;
use std::time::Duration;

use stagelink_core::{DeviceDescriptor, DisplayClass, PeerRole};
use stagelink_db::{Database, DbConfig};
use stagelink_sync::pairing::spawn_pairing_responder;
use stagelink_sync::{ConnectionManager, PairingService, SyncError};

use common::{link, peer, MemoryNetwork};

const ORG: &str = "grace-church";

fn device() -> DeviceDescriptor {
    DeviceDescriptor {
        display_id: "stage-left".into(),
        device_id: "device-9".into(),
        name: "Stage Left".into(),
        host: "10.0.0.9".into(),
        port: 3011,
        platform: "linux".into(),
        resolution: Some("1920x1080".into()),
    }
}

async fn pairing(ttl: Duration) -> (PairingService, Database) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    (PairingService::new(Arc::new(db.clone()), ttl, 5), db)
}

struct Pair {
    console: ConnectionManager,
    console_pairing: PairingService,
    console_db: Database,
    display_pairing: PairingService,
    responder: tokio::task::JoinHandle<()>,
}

async fn linked(ttl: Duration) -> Pair {
    let network = MemoryNetwork::default();
    let console = peer(&network, "console", PeerRole::Controller, 100);
    let display = peer(&network, "stage-left", PeerRole::Display, 50);
    link(&console, &display).await;

    let (console_pairing, console_db) = pairing(Duration::from_secs(300)).await;
    let (display_pairing, _) = pairing(ttl).await;
    let responder = spawn_pairing_responder(display, display_pairing.clone(), ORG.to_string());

    Pair {
        console,
        console_pairing,
        console_db,
        display_pairing,
        responder,
    }
}

#[tokio::test]
async fn controller_registers_display_that_issued_the_code() {
    let pair = linked(Duration::from_secs(300)).await;
    let record = pair.display_pairing.begin(ORG, &device()).await.unwrap();

    let registered = pair
        .console_pairing
        .confirm_remote(
            &pair.console,
            ORG,
            &record.code.to_lowercase(),
            DisplayClass::Audience,
            Some("Sanctuary".into()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(registered.display_id, "stage-left");
    assert_eq!(registered.name, "Sanctuary");
    assert_eq!(registered.host, "10.0.0.9");

    let stored = pair.console_db.displays().get_registered_displays(ORG).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!pair.display_pairing.cancel(ORG, &record.code).await.unwrap());

    pair.responder.abort();
}

#[tokio::test]
async fn expired_remote_code_is_reported_as_expired() {
    let pair = linked(Duration::ZERO).await;
    let record = pair.display_pairing.begin(ORG, &device()).await.unwrap();

    let result = pair
        .console_pairing
        .confirm_remote(&pair.console, ORG, &record.code, DisplayClass::Stage, None, Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(SyncError::PairingExpired(_))));
    assert!(pair
        .console_db
        .displays()
        .get_registered_displays(ORG)
        .await
        .unwrap()
        .is_empty());

    pair.responder.abort();
}

#[tokio::test]
async fn unknown_code_times_out_as_not_found() {
    let pair = linked(Duration::from_secs(300)).await;

    let result = pair
        .console_pairing
        .confirm_remote(&pair.console, ORG, "ZZZ999", DisplayClass::Stage, None, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(SyncError::PairingCodeNotFound(_))));

    pair.responder.abort();
}

#[tokio::test]
async fn request_for_another_organization_is_ignored() {
    let pair = linked(Duration::from_secs(300)).await;
    let record = pair.display_pairing.begin(ORG, &device()).await.unwrap();

    let result = pair
        .console_pairing
        .confirm_remote(&pair.console, "other-church", &record.code, DisplayClass::Stage, None, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(SyncError::PairingCodeNotFound(_))));
    // Still pending for the right organization
    assert!(pair.display_pairing.cancel(ORG, &record.code).await.unwrap());

    pair.responder.abort();
}

#[tokio::test]
async fn without_sessions_nothing_is_asked() {
    let network = MemoryNetwork::default();
    let console = peer(&network, "console", PeerRole::Controller, 100);
    let (console_pairing, _) = pairing(Duration::from_secs(300)).await;

    let result = console_pairing
        .confirm_remote(&console, ORG, "ABC234", DisplayClass::Stage, None, Duration::from_secs(30))
        .await;
    assert!(matches!(result, Err(SyncError::PairingCodeNotFound(_))));
}
