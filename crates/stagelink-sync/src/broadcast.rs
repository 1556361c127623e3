//! # Broadcast Coordinator
//!
//! Keeps the controller's presentation state and fans it out to displays.
//!
//! ## Precache Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  broadcast_precache(org, event)                                         │
//! │                                                                         │
//! │  ContentSource::get_event_items(event)      (failure aborts)            │
//! │        │                                                                │
//! │        ▼  per item, no lock held                                        │
//! │  ┌──────────────┐     ┌──────────────────────────────┐                  │
//! │  │ media item   │────►│ get_media_by_id + signed URL │──┐               │
//! │  └──────────────┘     └──────────────────────────────┘  │ ok  → bundle  │
//! │  ┌──────────────┐     ┌──────────────────────────────┐  │ err → failure │
//! │  │ song item    │────►│ get_song + signed backgrounds│──┘               │
//! │  └──────────────┘     └──────────────────────────────┘                  │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  one precache message ──► ConnectionManager::broadcast                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is fire-and-forget. A display that missed updates catches up
//! through [`BroadcastCoordinator::resync`] when it reconnects.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::content::{ContentSource, EventItem};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ControlMessage, LyricsPayload, PrecacheMedia, PrecachePayload, PrecacheSong, SlidePayload,
};

// =============================================================================
// Updates
// =============================================================================

/// New lyrics to show. With `target_id` set only that display receives it
/// and the shared state is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricsUpdate {
    pub org_id: String,
    pub event_id: String,
    pub song_id: String,
    pub title: String,
    pub text: String,
    pub background_url: Option<String>,
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideUpdate {
    pub org_id: String,
    pub event_id: String,
    pub song_id: String,
    pub slide_index: u32,
    pub target_id: Option<String>,
}

// =============================================================================
// Presentation State
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSong {
    pub song_id: String,
    pub title: String,
    pub text: String,
    pub background_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSlide {
    pub slide_index: u32,
}

/// What the displays should be showing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationState {
    pub org_id: Option<String>,
    pub event_id: Option<String>,
    pub song: Option<CurrentSong>,
    pub slide: Option<CurrentSlide>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PresentationState {
    fn lyrics_message(&self, sender_id: &str, target_id: Option<String>) -> Option<ControlMessage> {
        let song = self.song.as_ref()?;
        Some(ControlMessage::Lyrics(LyricsPayload {
            sender_id: sender_id.to_string(),
            target_id,
            org_id: self.org_id.clone().unwrap_or_default(),
            event_id: self.event_id.clone().unwrap_or_default(),
            song_id: song.song_id.clone(),
            title: song.title.clone(),
            text: song.text.clone(),
            background_url: song.background_url.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }))
    }

    fn slide_message(&self, sender_id: &str, target_id: Option<String>) -> Option<ControlMessage> {
        let song = self.song.as_ref()?;
        let slide = self.slide?;
        Some(ControlMessage::Slide(SlidePayload {
            sender_id: sender_id.to_string(),
            target_id,
            org_id: self.org_id.clone().unwrap_or_default(),
            event_id: self.event_id.clone().unwrap_or_default(),
            song_id: song.song_id.clone(),
            slide_index: slide.slide_index,
            timestamp: Utc::now().timestamp_millis(),
        }))
    }
}

// =============================================================================
// Precache Report
// =============================================================================

/// An event item that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheFailure {
    pub item_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheReport {
    pub media: Vec<PrecacheMedia>,
    pub songs: Vec<PrecacheSong>,
    pub failures: Vec<PrecacheFailure>,
    /// Peers that accepted the bundle.
    pub delivered: usize,
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Clone)]
pub struct BroadcastCoordinator {
    manager: ConnectionManager,
    content: Arc<dyn ContentSource>,
    media_url_ttl: Duration,
    state: Arc<RwLock<PresentationState>>,
}

impl std::fmt::Debug for BroadcastCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastCoordinator")
            .field("manager", &self.manager)
            .field("media_url_ttl", &self.media_url_ttl)
            .finish_non_exhaustive()
    }
}

impl BroadcastCoordinator {
    pub fn new(
        manager: ConnectionManager,
        content: Arc<dyn ContentSource>,
        media_url_ttl: Duration,
    ) -> Self {
        BroadcastCoordinator {
            manager,
            content,
            media_url_ttl,
            state: Arc::new(RwLock::new(PresentationState::default())),
        }
    }

    fn sender_id(&self) -> &str {
        self.manager.local_id()
    }

    /// Snapshot of the current presentation state.
    pub async fn state(&self) -> PresentationState {
        self.state.read().await.clone()
    }

    /// Sends lyrics. Returns the number of peers that accepted the message.
    pub async fn broadcast_lyrics(&self, update: LyricsUpdate) -> SyncResult<usize> {
        let message = ControlMessage::Lyrics(LyricsPayload {
            sender_id: self.sender_id().to_string(),
            target_id: update.target_id.clone(),
            org_id: update.org_id.clone(),
            event_id: update.event_id.clone(),
            song_id: update.song_id.clone(),
            title: update.title.clone(),
            text: update.text.clone(),
            background_url: update.background_url.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });

        if let Some(target) = update.target_id {
            let delivered = self.manager.send_to(&target, message).await;
            return Ok(usize::from(delivered));
        }

        {
            let mut state = self.state.write().await;
            let song_changed = state
                .song
                .as_ref()
                .map_or(true, |s| s.song_id != update.song_id);
            state.org_id = Some(update.org_id);
            state.event_id = Some(update.event_id);
            state.song = Some(CurrentSong {
                song_id: update.song_id.clone(),
                title: update.title,
                text: update.text,
                background_url: update.background_url,
            });
            if song_changed {
                state.slide = None;
            }
            state.updated_at = Some(Utc::now());
        }

        let delivered = self.manager.broadcast(message).await;
        info!(song_id = %update.song_id, delivered, "Lyrics broadcast");
        Ok(delivered)
    }

    /// Sends the current slide index.
    pub async fn broadcast_slide(&self, update: SlideUpdate) -> SyncResult<usize> {
        let message = ControlMessage::Slide(SlidePayload {
            sender_id: self.sender_id().to_string(),
            target_id: update.target_id.clone(),
            org_id: update.org_id.clone(),
            event_id: update.event_id.clone(),
            song_id: update.song_id.clone(),
            slide_index: update.slide_index,
            timestamp: Utc::now().timestamp_millis(),
        });

        if let Some(target) = update.target_id {
            let delivered = self.manager.send_to(&target, message).await;
            return Ok(usize::from(delivered));
        }

        {
            let mut state = self.state.write().await;
            state.org_id = Some(update.org_id);
            state.event_id = Some(update.event_id);
            if state.song.as_ref().map_or(true, |s| s.song_id != update.song_id) {
                // Slide for a song we never sent lyrics for
                state.song = Some(CurrentSong {
                    song_id: update.song_id.clone(),
                    title: String::new(),
                    text: String::new(),
                    background_url: None,
                });
            }
            state.slide = Some(CurrentSlide {
                slide_index: update.slide_index,
            });
            state.updated_at = Some(Utc::now());
        }

        let delivered = self.manager.broadcast(message).await;
        debug!(
            song_id = %update.song_id,
            slide_index = update.slide_index,
            delivered,
            "Slide broadcast"
        );
        Ok(delivered)
    }

    /// Sends the full current state (lyrics, then slide) to one peer.
    /// Returns the number of messages sent; zero when nothing is showing or
    /// the peer is gone.
    pub async fn resync(&self, peer_id: &str) -> SyncResult<usize> {
        let messages: Vec<ControlMessage> = {
            let state = self.state.read().await;
            [
                state.lyrics_message(self.sender_id(), Some(peer_id.to_string())),
                state.slide_message(self.sender_id(), Some(peer_id.to_string())),
            ]
            .into_iter()
            .flatten()
            .collect()
        };

        let mut sent = 0;
        for message in messages {
            if !self.manager.send_to(peer_id, message).await {
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            info!(peer_id = %peer_id, count = sent, "Resynced peer");
        }
        Ok(sent)
    }

    /// Resolves every item of `event_id`, signs its URLs and broadcasts the
    /// bundle once.
    pub async fn broadcast_precache(&self, org_id: &str, event_id: &str) -> SyncResult<PrecacheReport> {
        let items = self.content.get_event_items(event_id).await?;
        let mut report = PrecacheReport::default();
        let mut seen_media = HashSet::new();

        for item in &items {
            let resolved = match item {
                EventItem::Media { media_id } => {
                    if !seen_media.insert(media_id.clone()) {
                        continue;
                    }
                    self.resolve_media(media_id).await.map(|m| report.media.push(m))
                }
                EventItem::Song { song_id } => {
                    self.resolve_song(song_id).await.map(|s| report.songs.push(s))
                }
            };
            if let Err(e) = resolved {
                warn!(item_id = %item.id(), error = %e, "Precache item skipped");
                report.failures.push(PrecacheFailure {
                    item_id: item.id().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let message = ControlMessage::Precache(PrecachePayload {
            sender_id: self.sender_id().to_string(),
            target_id: None,
            org_id: org_id.to_string(),
            event_id: event_id.to_string(),
            media: report.media.clone(),
            songs: report.songs.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        report.delivered = self.manager.broadcast(message).await;

        info!(
            event_id = %event_id,
            media = report.media.len(),
            songs = report.songs.len(),
            failures = report.failures.len(),
            delivered = report.delivered,
            "Precache broadcast"
        );
        Ok(report)
    }

    async fn resolve_media(&self, media_id: &str) -> SyncResult<PrecacheMedia> {
        let media = self.content.get_media_by_id(media_id).await?;
        let url = self.content.get_signed_url(&media.path, self.media_url_ttl).await?;
        Ok(PrecacheMedia {
            media_id: media.id,
            url,
            kind: media.kind,
            expires_at: self.url_expiry()?,
        })
    }

    async fn resolve_song(&self, song_id: &str) -> SyncResult<PrecacheSong> {
        let song = self.content.get_song(song_id).await?;
        let mut backgrounds = Vec::with_capacity(song.background_paths.len());
        for path in &song.background_paths {
            backgrounds.push(self.content.get_signed_url(path, self.media_url_ttl).await?);
        }
        Ok(PrecacheSong {
            song_id: song.id,
            title: song.title,
            lyrics: song.lyrics,
            backgrounds,
            updated_at: song.updated_at.timestamp_millis(),
        })
    }

    fn url_expiry(&self) -> SyncResult<i64> {
        let ttl = chrono::Duration::from_std(self.media_url_ttl)
            .map_err(|e| SyncError::InvalidConfig(format!("media_url_ttl: {}", e)))?;
        Ok((Utc::now() + ttl).timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ManagerSettings;
    use crate::content::NoContent;
    use crate::transport::{Channel, Transport};
    use async_trait::async_trait;
    use stagelink_core::{PeerIdentity, PeerRole, Priority};

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn open(&self, endpoint: &str) -> SyncResult<Channel> {
            Err(SyncError::ConnectionFailed(endpoint.to_string()))
        }
    }

    fn coordinator() -> BroadcastCoordinator {
        let manager = ConnectionManager::new(
            PeerIdentity::from_parts("console", PeerRole::Controller, "Console", Priority::new(PeerRole::Controller, 1)),
            ManagerSettings::default(),
            Arc::new(NoTransport),
            None,
        );
        BroadcastCoordinator::new(manager, Arc::new(NoContent), Duration::from_secs(3600))
    }

    fn lyrics(song_id: &str) -> LyricsUpdate {
        LyricsUpdate {
            org_id: "org".into(),
            event_id: "event".into(),
            song_id: song_id.into(),
            title: "Amazing Grace".into(),
            text: "Amazing grace, how sweet the sound".into(),
            background_url: None,
            target_id: None,
        }
    }

    fn slide(song_id: &str, index: u32) -> SlideUpdate {
        SlideUpdate {
            org_id: "org".into(),
            event_id: "event".into(),
            song_id: song_id.into(),
            slide_index: index,
            target_id: None,
        }
    }

    #[tokio::test]
    async fn test_state_tracks_untargeted_updates() {
        let coordinator = coordinator();
        assert_eq!(coordinator.broadcast_lyrics(lyrics("song-1")).await.unwrap(), 0);
        assert_eq!(coordinator.broadcast_slide(slide("song-1", 3)).await.unwrap(), 0);

        let state = coordinator.state().await;
        assert_eq!(state.song.as_ref().unwrap().song_id, "song-1");
        assert_eq!(state.slide, Some(CurrentSlide { slide_index: 3 }));

        // A new song starts without a slide
        coordinator.broadcast_lyrics(lyrics("song-2")).await.unwrap();
        assert_eq!(coordinator.state().await.slide, None);
    }

    #[tokio::test]
    async fn test_update_for_gone_peer_is_dropped() {
        let coordinator = coordinator();
        let mut update = lyrics("song-1");
        update.target_id = Some("display-1".into());
        assert_eq!(coordinator.broadcast_lyrics(update).await.unwrap(), 0);

        let mut update = slide("song-1", 2);
        update.target_id = Some("display-1".into());
        assert_eq!(coordinator.broadcast_slide(update).await.unwrap(), 0);

        assert_eq!(coordinator.state().await, PresentationState::default());
    }

    #[tokio::test]
    async fn test_resync_of_gone_peer_sends_nothing() {
        let coordinator = coordinator();
        coordinator.broadcast_lyrics(lyrics("song-1")).await.unwrap();
        coordinator.broadcast_slide(slide("song-1", 1)).await.unwrap();

        assert_eq!(coordinator.resync("display-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_precache_fails_without_event_items() {
        let coordinator = coordinator();
        let result = coordinator.broadcast_precache("org", "event").await;
        assert!(matches!(result, Err(SyncError::ContentUnavailable(_))));
    }

    #[tokio::test]
    async fn test_resync_with_empty_state_sends_nothing() {
        let coordinator = coordinator();
        assert_eq!(coordinator.resync("display-1").await.unwrap(), 0);
    }
}
