//! # Pairing
//!
//! A display in pairing mode shows a six character code; an operator types
//! it into a controller, which turns the pending record into a durable
//! registration.
//!
//! The pending record lives in the store of the node that issued the code.
//! When that is the controller itself ([`PairingService::begin`] on behalf
//! of a discovered device) the code is redeemed locally. When the display
//! issued it, the controller asks over the open sessions:
//!
//! ```text
//! display                                               controller
//!    │  begin(org, device)                                   │
//!    │  store: purge expired, insert(code)                   │
//!    │  shows code                                           │
//!    │                                                       │  confirm(code)
//!    │                                                       │  local take → not found
//!    │◄──────────── pairingRequest { orgId, code } ──────────│  (every session)
//!    │  redeem(code): take (single use)                      │
//!    │    found      → record                                │
//!    │    expired    → expired = true                        │
//!    │    not found  → stay silent                           │
//!    │───── pairingResult { record?, expired } ─────────────►│
//!    │                                                       │  upsert RegisteredDisplay
//!    │                                                       │  no answer in time
//!    │                                                       │    → PairingCodeNotFound
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use stagelink_core::pairing::{generate, PairingCode};
use stagelink_core::validation::{validate_display_name, validate_org_id};
use stagelink_core::{DeviceDescriptor, DisplayClass, PairingRecord, RegisteredDisplay};

use crate::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;
use crate::protocol::{ControlMessage, PairingRequestPayload, PairingResultPayload};
use crate::store::DisplayStore;

/// Issues and redeems pairing codes.
#[derive(Clone)]
pub struct PairingService {
    store: Arc<dyn DisplayStore>,
    ttl: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for PairingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingService")
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl PairingService {
    pub fn new(store: Arc<dyn DisplayStore>, ttl: Duration, max_attempts: u32) -> Self {
        PairingService {
            store,
            ttl,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Puts `device` into pairing mode for `org_id` and returns the pending
    /// record, whose `code` is what the display shows.
    pub async fn begin(&self, org_id: &str, device: &DeviceDescriptor) -> SyncResult<PairingRecord> {
        validate_org_id(org_id)?;
        validate_display_name(&device.name)?;

        let now = Utc::now();
        let purged = self.store.purge_expired_pairings(now).await?;
        if purged > 0 {
            debug!(count = purged, "Purged expired pairings");
        }

        for attempt in 1..=self.max_attempts {
            let code = generate();
            let record = PairingRecord::new(code.as_str(), org_id, device, now, self.ttl);
            if self.store.insert_pairing(&record).await? {
                info!(
                    org_id = %org_id,
                    display_id = %device.display_id,
                    expires_at = %record.expires_at,
                    "Pairing started"
                );
                return Ok(record);
            }
            debug!(attempt, "Pairing code collision, retrying");
        }

        warn!(org_id = %org_id, attempts = self.max_attempts, "No free pairing code");
        Err(SyncError::PairingCodeExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Redeems a code issued here and registers the display. A code works
    /// once; an expired code is consumed and rejected.
    pub async fn confirm(
        &self,
        org_id: &str,
        code: &str,
        class: DisplayClass,
        name: Option<String>,
    ) -> SyncResult<RegisteredDisplay> {
        let name = name.map(|n| validate_display_name(&n)).transpose()?;
        let record = self.redeem(org_id, code).await?;
        self.register(&record, class, name, Utc::now()).await
    }

    /// Takes the pending record for `code` out of the store.
    ///
    /// ## Errors
    /// - `PairingCodeNotFound` if no record is pending for the code
    /// - `PairingExpired` if it was pending but past its expiry (the record
    ///   is consumed either way)
    pub async fn redeem(&self, org_id: &str, code: &str) -> SyncResult<PairingRecord> {
        validate_org_id(org_id)?;
        let code = PairingCode::parse(code)?;

        let record = self
            .store
            .take_pairing(org_id, code.as_str())
            .await?
            .ok_or_else(|| SyncError::PairingCodeNotFound(code.to_string()))?;

        if record.is_expired(Utc::now()) {
            info!(org_id = %org_id, display_id = %record.display_id, "Pairing code expired");
            return Err(SyncError::PairingExpired(code.to_string()));
        }
        Ok(record)
    }

    /// Turns a redeemed record into a registration in this node's store.
    pub async fn register(
        &self,
        record: &PairingRecord,
        class: DisplayClass,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> SyncResult<RegisteredDisplay> {
        let registered = RegisteredDisplay::from_pairing(record, class, name, now);
        self.store.upsert_registered_display(&registered).await?;

        info!(
            org_id = %registered.org_id,
            display_id = %registered.display_id,
            class = %registered.class,
            name = %registered.name,
            "Display paired"
        );
        Ok(registered)
    }

    /// Withdraws a pending code. Returns false if it was not pending.
    pub async fn cancel(&self, org_id: &str, code: &str) -> SyncResult<bool> {
        let code = PairingCode::parse(code)?;
        self.store.delete_pairing(org_id, code.as_str()).await
    }

    /// Redeems `code` with whichever connected display issued it and
    /// registers that display here.
    ///
    /// Fails with `PairingCodeNotFound` when nobody is connected or no
    /// display answers within `within`.
    pub async fn confirm_remote(
        &self,
        manager: &ConnectionManager,
        org_id: &str,
        code: &str,
        class: DisplayClass,
        name: Option<String>,
        within: Duration,
    ) -> SyncResult<RegisteredDisplay> {
        validate_org_id(org_id)?;
        let code = PairingCode::parse(code)?;
        let name = name.map(|n| validate_display_name(&n)).transpose()?;

        let deadline = Instant::now() + within;
        let mut events = manager.subscribe();
        let asked = manager
            .broadcast(ControlMessage::PairingRequest(PairingRequestPayload {
                sender_id: manager.local_id().to_string(),
                target_id: None,
                org_id: org_id.to_string(),
                code: code.to_string(),
            }))
            .await;
        if asked == 0 {
            return Err(SyncError::PairingCodeNotFound(code.to_string()));
        }
        debug!(asked, "Asked connected peers to redeem pairing code");

        loop {
            let answer = match timeout_at(deadline, events.recv()).await {
                Ok(Ok(SyncEvent::Message {
                    message: ControlMessage::PairingResult(answer),
                    ..
                })) if answer.code == code.as_str() => answer,
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(SyncError::ShuttingDown),
                Err(_) => {
                    info!(asked, "No display holds the pairing code");
                    return Err(SyncError::PairingCodeNotFound(code.to_string()));
                }
            };

            if answer.expired {
                return Err(SyncError::PairingExpired(code.to_string()));
            }
            match answer.record {
                Some(record) if record.org_id == org_id && record.code == code.as_str() => {
                    return self.register(&record, class, name, Utc::now()).await;
                }
                _ => {
                    warn!(from = %answer.sender_id, "Ignoring malformed pairing result");
                }
            }
        }
    }
}

/// Answers `pairingRequest`s for codes this node issued. Runs on displays
/// until the manager's event stream closes; abort the handle to stop it.
pub fn spawn_pairing_responder(
    manager: ConnectionManager,
    pairing: PairingService,
    org_id: String,
) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let (from, request) = match events.recv().await {
                Ok(SyncEvent::Message {
                    from,
                    message: ControlMessage::PairingRequest(request),
                }) => (from, request),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Pairing responder lagged behind events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if request.org_id != org_id {
                debug!(from = %from, org_id = %request.org_id, "Pairing request for another organization");
                continue;
            }

            let Ok(code) = PairingCode::parse(&request.code) else {
                debug!(from = %from, "Ignoring malformed pairing code");
                continue;
            };
            let (record, expired) = match pairing.redeem(&org_id, code.as_str()).await {
                Ok(record) => (Some(record), false),
                Err(SyncError::PairingExpired(_)) => (None, true),
                Err(SyncError::PairingCodeNotFound(_)) | Err(SyncError::Validation(_)) => continue,
                Err(e) => {
                    warn!(from = %from, error = %e, "Pairing request failed");
                    continue;
                }
            };

            let reply = ControlMessage::PairingResult(PairingResultPayload {
                sender_id: manager.local_id().to_string(),
                target_id: from.clone(),
                code: code.to_string(),
                record,
                expired,
            });
            if manager.send_to(&from, reply).await {
                info!(controller = %from, expired, "Answered pairing request");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagelink_db::{Database, DbConfig};

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            display_id: "display-1".into(),
            device_id: "device-1".into(),
            name: "Stage Left".into(),
            host: "10.0.0.5".into(),
            port: 3010,
            platform: "linux".into(),
            resolution: Some("1920x1080".into()),
        }
    }

    async fn service(ttl: Duration) -> (PairingService, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        (PairingService::new(Arc::new(db.clone()), ttl, 5), db)
    }

    #[tokio::test]
    async fn test_begin_then_confirm_registers_display() {
        let (pairing, db) = service(Duration::from_secs(300)).await;

        let record = pairing.begin("org", &device()).await.unwrap();
        assert_eq!(record.code.len(), 6);

        let registered = pairing
            .confirm("org", &record.code.to_lowercase(), DisplayClass::Audience, Some("Main".into()))
            .await
            .unwrap();
        assert_eq!(registered.display_id, "display-1");
        assert_eq!(registered.name, "Main");
        assert_eq!(registered.class, DisplayClass::Audience);
        assert!(registered.online);

        let stored = db.displays().get_registered_displays("org").await.unwrap();
        assert_eq!(stored.len(), 1);

        // Single use
        let again = pairing
            .confirm("org", &record.code, DisplayClass::Audience, None)
            .await;
        assert!(matches!(again, Err(SyncError::PairingCodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let (pairing, db) = service(Duration::ZERO).await;
        let record = pairing.begin("org", &device()).await.unwrap();

        let result = pairing
            .confirm("org", &record.code, DisplayClass::Stage, None)
            .await;
        assert!(matches!(result, Err(SyncError::PairingExpired(_))));
        assert!(db.displays().get_registered_displays("org").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redeem_consumes_without_registering() {
        let (pairing, db) = service(Duration::from_secs(300)).await;
        let record = pairing.begin("org", &device()).await.unwrap();

        let redeemed = pairing.redeem("org", &record.code).await.unwrap();
        assert_eq!(redeemed.code, record.code);
        assert_eq!(redeemed.display_id, "display-1");
        assert!(db.displays().get_registered_displays("org").await.unwrap().is_empty());
        assert!(matches!(
            pairing.redeem("org", &record.code).await,
            Err(SyncError::PairingCodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_code_is_scoped_to_organization() {
        let (pairing, _db) = service(Duration::from_secs(300)).await;
        let record = pairing.begin("org-a", &device()).await.unwrap();

        let result = pairing
            .confirm("org-b", &record.code, DisplayClass::Stage, None)
            .await;
        assert!(matches!(result, Err(SyncError::PairingCodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_code_fails_validation() {
        let (pairing, _db) = service(Duration::from_secs(300)).await;
        let result = pairing.confirm("org", "O0I1", DisplayClass::Stage, None).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancel_withdraws_code() {
        let (pairing, _db) = service(Duration::from_secs(300)).await;
        let record = pairing.begin("org", &device()).await.unwrap();

        assert!(pairing.cancel("org", &record.code).await.unwrap());
        assert!(!pairing.cancel("org", &record.code).await.unwrap());
    }
}
