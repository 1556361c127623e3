mod common;

use std::time::Duration;

use stagelink_core::PeerRole;
use stagelink_sync::SyncError;

use common::{link, peer, MemoryNetwork};

const WITHIN: Duration = Duration::from_secs(5);

#[tokio::test]
async fn displays_meet_through_the_hub() {
    let network = MemoryNetwork::default();
    let hub = peer(&network, "hub", PeerRole::Controller, 1);
    let left = peer(&network, "display-1", PeerRole::Display, 1);
    let right = peer(&network, "display-2", PeerRole::Display, 2);
    link(&hub, &left).await;
    link(&hub, &right).await;

    assert_eq!(left.leader_status().await.leader_id.as_deref(), Some("hub"));
    let connected = left.negotiate("display-2", None, WITHIN).await.unwrap();

    assert_eq!(connected, "display-2");
    assert!(left.is_connected("display-2").await);
    assert!(right.is_connected("display-1").await);
    assert!(left.negotiation("display-2").await.is_none());
}

#[tokio::test]
async fn newer_negotiation_supersedes_older_one() {
    let network = MemoryNetwork::default();
    let hub = peer(&network, "hub", PeerRole::Controller, 1);
    let left = peer(&network, "display-1", PeerRole::Display, 1);
    let right = peer(&network, "display-2", PeerRole::Display, 2);
    link(&hub, &left).await;
    link(&hub, &right).await;

    let (first, second) = tokio::join!(
        left.negotiate("display-2", None, WITHIN),
        left.negotiate("display-2", None, WITHIN),
    );

    assert!(matches!(first, Err(SyncError::NegotiationFailed { .. })));
    assert_eq!(second.unwrap(), "display-2");
    let sessions = left
        .connections()
        .await
        .into_iter()
        .filter(|c| c.peer_id == "display-2")
        .count();
    assert_eq!(sessions, 1);
}

#[tokio::test]
async fn simultaneous_offers_converge_on_one_session() {
    let network = MemoryNetwork::default();
    let hub = peer(&network, "hub", PeerRole::Controller, 1);
    let left = peer(&network, "display-1", PeerRole::Display, 1);
    let right = peer(&network, "display-2", PeerRole::Display, 2);
    link(&hub, &left).await;
    link(&hub, &right).await;

    let (a, b) = tokio::join!(
        left.negotiate("display-2", None, WITHIN),
        right.negotiate("display-1", None, WITHIN),
    );

    assert_eq!(a.unwrap(), "display-2");
    assert_eq!(b.unwrap(), "display-1");
    assert!(left.is_connected("display-2").await);
    assert!(right.is_connected("display-1").await);
}

#[tokio::test]
async fn negotiation_without_any_peer_has_no_rendezvous() {
    let network = MemoryNetwork::default();
    let lonely = peer(&network, "display-1", PeerRole::Display, 1);

    let result = lonely.negotiate("display-2", None, WITHIN).await;
    assert!(matches!(result, Err(SyncError::NoRendezvous)));
}

#[tokio::test]
async fn unreachable_target_times_out() {
    let network = MemoryNetwork::default();
    let hub = peer(&network, "hub", PeerRole::Controller, 1);
    let left = peer(&network, "display-1", PeerRole::Display, 1);
    link(&hub, &left).await;

    // The hub drops offers for peers it does not know
    let result = left
        .negotiate("display-9", None, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(SyncError::Timeout { .. })));
    assert!(left.negotiation("display-9").await.is_none());
}
