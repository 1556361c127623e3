//! # Display Store
//!
//! Durable registry seam used by pairing and liveness. The production
//! implementation is [`stagelink_db::Database`]; tests may supply their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stagelink_core::{PairingRecord, RegisteredDisplay};
use stagelink_db::Database;

use crate::error::SyncResult;

/// Persistence for registered displays and pending pairings.
#[async_trait]
pub trait DisplayStore: Send + Sync + 'static {
    async fn get_registered_displays(&self, org_id: &str) -> SyncResult<Vec<RegisteredDisplay>>;

    async fn upsert_registered_display(&self, display: &RegisteredDisplay) -> SyncResult<()>;

    /// Records a sign of life. Returns false if the display is not
    /// registered to `org_id`.
    async fn touch_display(
        &self,
        org_id: &str,
        display_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<bool>;

    /// Records where a display was last reached, with a sign of life.
    async fn update_display_address(
        &self,
        org_id: &str,
        display_id: &str,
        host: &str,
        port: u16,
        at: DateTime<Utc>,
    ) -> SyncResult<bool>;

    /// Flips displays silent for at least `window` to offline. Returns the
    /// number of transitions.
    async fn mark_stale_offline(
        &self,
        org_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> SyncResult<u64>;

    async fn remove_registered_display(&self, org_id: &str, display_id: &str) -> SyncResult<bool>;

    /// Stores a pending pairing. Returns false if the code is already
    /// pending for the same organization.
    async fn insert_pairing(&self, record: &PairingRecord) -> SyncResult<bool>;

    /// Removes and returns a pending pairing, expired or not.
    async fn take_pairing(&self, org_id: &str, code: &str) -> SyncResult<Option<PairingRecord>>;

    async fn delete_pairing(&self, org_id: &str, code: &str) -> SyncResult<bool>;

    async fn purge_expired_pairings(&self, now: DateTime<Utc>) -> SyncResult<u64>;
}

#[async_trait]
impl DisplayStore for Database {
    async fn get_registered_displays(&self, org_id: &str) -> SyncResult<Vec<RegisteredDisplay>> {
        Ok(self.displays().get_registered_displays(org_id).await?)
    }

    async fn upsert_registered_display(&self, display: &RegisteredDisplay) -> SyncResult<()> {
        Ok(self.displays().upsert(display).await?)
    }

    async fn touch_display(
        &self,
        org_id: &str,
        display_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        Ok(self.displays().touch(org_id, display_id, at).await?)
    }

    async fn update_display_address(
        &self,
        org_id: &str,
        display_id: &str,
        host: &str,
        port: u16,
        at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        Ok(self
            .displays()
            .update_address(org_id, display_id, host, port, at)
            .await?)
    }

    async fn mark_stale_offline(
        &self,
        org_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> SyncResult<u64> {
        Ok(self.displays().mark_stale_offline(org_id, window, now).await?)
    }

    async fn remove_registered_display(&self, org_id: &str, display_id: &str) -> SyncResult<bool> {
        Ok(self.displays().remove(org_id, display_id).await?)
    }

    async fn insert_pairing(&self, record: &PairingRecord) -> SyncResult<bool> {
        match self.pairings().insert(record).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn take_pairing(&self, org_id: &str, code: &str) -> SyncResult<Option<PairingRecord>> {
        Ok(self.pairings().take(org_id, code).await?)
    }

    async fn delete_pairing(&self, org_id: &str, code: &str) -> SyncResult<bool> {
        Ok(self.pairings().delete(org_id, code).await?)
    }

    async fn purge_expired_pairings(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        Ok(self.pairings().purge_expired(now).await?)
    }
}
