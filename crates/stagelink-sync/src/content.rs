//! # Content Source
//!
//! Songs, media and signed URLs live outside this subsystem. The broadcast
//! coordinator reads them through [`ContentSource`] when it builds precache
//! bundles.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// One entry of an event's running order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventItem {
    Song { song_id: String },
    Media { media_id: String },
}

impl EventItem {
    pub fn id(&self) -> &str {
        match self {
            EventItem::Song { song_id } => song_id,
            EventItem::Media { media_id } => media_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub lyrics: String,
    /// Storage paths of background images, unsigned.
    pub background_paths: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    /// Storage path, unsigned.
    pub path: String,
    /// "image", "video", ...
    pub kind: String,
}

/// Read access to presentation content.
#[async_trait]
pub trait ContentSource: Send + Sync + 'static {
    async fn get_event_items(&self, event_id: &str) -> SyncResult<Vec<EventItem>>;

    async fn get_song(&self, song_id: &str) -> SyncResult<Song>;

    async fn get_media_by_id(&self, media_id: &str) -> SyncResult<Media>;

    /// Returns a URL for `path` valid for `ttl`.
    async fn get_signed_url(&self, path: &str, ttl: Duration) -> SyncResult<String>;
}

/// Content source for nodes with no content backend attached, such as
/// pure display nodes. Every lookup fails with `ContentUnavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContent;

#[async_trait]
impl ContentSource for NoContent {
    async fn get_event_items(&self, event_id: &str) -> SyncResult<Vec<EventItem>> {
        Err(SyncError::ContentUnavailable(format!("event {}", event_id)))
    }

    async fn get_song(&self, song_id: &str) -> SyncResult<Song> {
        Err(SyncError::ContentUnavailable(format!("song {}", song_id)))
    }

    async fn get_media_by_id(&self, media_id: &str) -> SyncResult<Media> {
        Err(SyncError::ContentUnavailable(format!("media {}", media_id)))
    }

    async fn get_signed_url(&self, path: &str, _ttl: Duration) -> SyncResult<String> {
        Err(SyncError::ContentUnavailable(format!("signed url for {}", path)))
    }
}
