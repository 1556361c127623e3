//! Shared fixtures: an in-process network of connection managers and a
//! static content source.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::broadcast;

use stagelink_core::{PeerIdentity, PeerRole, Priority};
use stagelink_sync::connection::{ConnectionManager, ManagerSettings};
use stagelink_sync::content::{ContentSource, EventItem, Media, Song};
use stagelink_sync::{Channel, ControlMessage, SyncError, SyncEvent, SyncResult, Transport};

// =============================================================================
// Memory Network
// =============================================================================

/// Endpoints are `mem://<peer id>`; opening one hands the far end of an
/// in-memory channel to that peer's manager.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

impl MemoryNetwork {
    pub fn endpoint(peer_id: &str) -> String {
        format!("mem://{peer_id}")
    }

    pub fn join(&self, manager: &ConnectionManager) {
        self.peers
            .lock()
            .unwrap()
            .insert(Self::endpoint(manager.local_id()), manager.clone());
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn open(&self, endpoint: &str) -> SyncResult<Channel> {
        let acceptor = self
            .peers
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| SyncError::ConnectionFailed(endpoint.to_string()))?;

        let (local, remote) = Channel::pair(64);
        tokio::spawn(async move {
            let _ = acceptor.accept(remote).await;
        });
        Ok(local)
    }
}

/// A manager on `network` that offers its `mem://` endpoint as candidate.
pub fn peer(network: &MemoryNetwork, id: &str, role: PeerRole, started_at: i64) -> ConnectionManager {
    let settings = ManagerSettings {
        heartbeat_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(180),
        local_candidates: vec![MemoryNetwork::endpoint(id)],
        ..ManagerSettings::default()
    };
    let manager = ConnectionManager::new(
        PeerIdentity::from_parts(id, role, id, Priority::new(role, started_at)),
        settings,
        Arc::new(network.clone()),
        None,
    );
    network.join(&manager);
    manager
}

/// Connects two managers directly and waits for both handshakes.
pub async fn link(a: &ConnectionManager, b: &ConnectionManager) {
    let (ca, cb) = Channel::pair(64);
    let (ra, rb) = tokio::join!(a.accept(ca), b.accept(cb));
    assert_eq!(ra.unwrap(), b.local_id());
    assert_eq!(rb.unwrap(), a.local_id());
}

/// Waits up to 5s for an event matching `pred`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            other => panic!("event not observed: {other:?}"),
        }
    }
}

/// Waits for the next control message of type `type_name`.
pub async fn next_message(events: &mut broadcast::Receiver<SyncEvent>, type_name: &str) -> ControlMessage {
    match wait_for(events, |e| {
        matches!(e, SyncEvent::Message { message, .. } if message.type_name() == type_name)
    })
    .await
    {
        SyncEvent::Message { message, .. } => message,
        _ => unreachable!(),
    }
}

// =============================================================================
// Static Content
// =============================================================================

#[derive(Debug, Default)]
pub struct StaticContent {
    pub events: HashMap<String, Vec<EventItem>>,
    pub songs: HashMap<String, Song>,
    pub media: HashMap<String, Media>,
    /// Paths whose URL signing fails.
    pub unsignable: HashSet<String>,
}

impl StaticContent {
    pub fn add_media(&mut self, event_id: &str, media_id: &str) {
        self.media.insert(
            media_id.to_string(),
            Media {
                id: media_id.to_string(),
                path: format!("media/{media_id}.jpg"),
                kind: "image".to_string(),
            },
        );
        self.events
            .entry(event_id.to_string())
            .or_default()
            .push(EventItem::Media {
                media_id: media_id.to_string(),
            });
    }

    pub fn add_song(&mut self, event_id: &str, song_id: &str, backgrounds: &[&str]) {
        self.songs.insert(
            song_id.to_string(),
            Song {
                id: song_id.to_string(),
                title: format!("Song {song_id}"),
                lyrics: "Verse one\n\nChorus".to_string(),
                background_paths: backgrounds.iter().map(|b| b.to_string()).collect(),
                updated_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            },
        );
        self.events
            .entry(event_id.to_string())
            .or_default()
            .push(EventItem::Song {
                song_id: song_id.to_string(),
            });
    }
}

#[async_trait]
impl ContentSource for StaticContent {
    async fn get_event_items(&self, event_id: &str) -> SyncResult<Vec<EventItem>> {
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| SyncError::ContentUnavailable(format!("event {event_id}")))
    }

    async fn get_song(&self, song_id: &str) -> SyncResult<Song> {
        self.songs
            .get(song_id)
            .cloned()
            .ok_or_else(|| SyncError::ContentUnavailable(format!("song {song_id}")))
    }

    async fn get_media_by_id(&self, media_id: &str) -> SyncResult<Media> {
        self.media
            .get(media_id)
            .cloned()
            .ok_or_else(|| SyncError::ContentUnavailable(format!("media {media_id}")))
    }

    async fn get_signed_url(&self, path: &str, ttl: Duration) -> SyncResult<String> {
        if self.unsignable.contains(path) {
            return Err(SyncError::ContentUnavailable(format!("cannot sign {path}")));
        }
        Ok(format!("https://cdn.example.test/{path}?ttl={}", ttl.as_secs()))
    }
}
