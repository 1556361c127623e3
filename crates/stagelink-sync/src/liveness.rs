//! # Liveness Monitor
//!
//! Heartbeats in, stale sweep out.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  every connection ──► heartbeat task ──► heartbeat{senderId} ──► peer  │
//! │                                                                         │
//! │  any inbound message ──► on_heartbeat(peer) ──► last_seen_at = now     │
//! │                                                 online       = true    │
//! │                                                                         │
//! │  sweep task (every sweep_interval) ──► mark_stale_offline(window)      │
//! │                                          online = false when           │
//! │                                          now - last_seen_at >= window  │
//! │                                                                         │
//! │  The sweep is the only way a display goes offline. A display that dies │
//! │  silently is noticed purely by heartbeat absence.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::protocol::ControlMessage;
use crate::store::DisplayStore;
use crate::transport::ChannelHandle;

/// Tracks display liveness in the durable registry of one organization.
#[derive(Clone)]
pub struct LivenessMonitor {
    store: Arc<dyn DisplayStore>,
    org_id: String,
    stale_window: Duration,
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("org_id", &self.org_id)
            .field("stale_window", &self.stale_window)
            .finish_non_exhaustive()
    }
}

impl LivenessMonitor {
    pub fn new(store: Arc<dyn DisplayStore>, org_id: impl Into<String>, stale_window: Duration) -> Self {
        LivenessMonitor {
            store,
            org_id: org_id.into(),
            stale_window,
        }
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    /// Marks `peer_id` seen now. Returns false for peers that are not a
    /// registered display of the organization.
    pub async fn on_heartbeat(&self, peer_id: &str) -> SyncResult<bool> {
        self.on_heartbeat_at(peer_id, Utc::now()).await
    }

    pub async fn on_heartbeat_at(&self, peer_id: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        let touched = self.store.touch_display(&self.org_id, peer_id, at).await?;
        if touched {
            debug!(peer_id = %peer_id, "Display heartbeat");
        }
        Ok(touched)
    }

    /// Records the address a display connected from, with a sign of life.
    pub async fn on_address(&self, peer_id: &str, host: &str, port: u16) -> SyncResult<bool> {
        self.store
            .update_display_address(&self.org_id, peer_id, host, port, Utc::now())
            .await
    }

    /// One sweep with the configured window.
    pub async fn sweep(&self) -> SyncResult<u64> {
        self.mark_stale_offline(self.stale_window, Utc::now()).await
    }

    /// Flips every display silent for at least `window` to offline.
    pub async fn mark_stale_offline(&self, window: Duration, now: DateTime<Utc>) -> SyncResult<u64> {
        let flipped = self.store.mark_stale_offline(&self.org_id, window, now).await?;
        if flipped > 0 {
            info!(org_id = %self.org_id, count = flipped, "Displays went offline");
        }
        Ok(flipped)
    }

    /// Spawns the periodic sweep. Abort the handle to stop it.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.sweep().await {
                    warn!(error = %e, "Stale sweep failed");
                }
            }
        })
    }
}

/// Spawns the heartbeat sender for one connection. The task ends on its
/// own once the channel closes.
pub fn spawn_heartbeat(handle: ChannelHandle, sender_id: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if handle.is_closed() {
                break;
            }
            if let Err(e) = handle.send(ControlMessage::heartbeat(&sender_id)) {
                debug!(error = %e, "Heartbeat not sent");
                if handle.is_closed() {
                    break;
                }
            }
        }
    })
}
