//! # Registered Display Repository
//!
//! ## Liveness Columns
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  heartbeat / connect ──► touch()               last_seen_at = now       │
//! │                                                online       = 1         │
//! │                                                                         │
//! │  sweep task ─────────► mark_stale_offline()    online = 0 WHERE         │
//! │                                                last_seen_at <=          │
//! │                                                now - stale_window       │
//! │                                                                         │
//! │  A display is never deleted here except by remove() (operator action). │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use stagelink_core::{DisplayClass, RegisteredDisplay};

use super::{from_millis, to_port};
use crate::error::DbResult;

const TABLE: &str = "registered_displays";

#[derive(Debug, sqlx::FromRow)]
struct DisplayRow {
    display_id: String,
    org_id: String,
    device_id: String,
    name: String,
    class: DisplayClass,
    host: String,
    port: i64,
    platform: String,
    last_seen_at: i64,
    online: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<DisplayRow> for RegisteredDisplay {
    type Error = crate::error::DbError;

    fn try_from(row: DisplayRow) -> Result<Self, Self::Error> {
        Ok(RegisteredDisplay {
            port: to_port(TABLE, row.port)?,
            last_seen_at: from_millis(TABLE, "last_seen_at", row.last_seen_at)?,
            created_at: from_millis(TABLE, "created_at", row.created_at)?,
            updated_at: from_millis(TABLE, "updated_at", row.updated_at)?,
            display_id: row.display_id,
            org_id: row.org_id,
            device_id: row.device_id,
            name: row.name,
            class: row.class,
            host: row.host,
            platform: row.platform,
            online: row.online,
        })
    }
}

/// Repository for the display registry.
#[derive(Debug, Clone)]
pub struct DisplayRepository {
    pool: SqlitePool,
}

impl DisplayRepository {
    /// Creates a new DisplayRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DisplayRepository { pool }
    }

    /// Lists every display registered to `org_id`, ordered by name.
    pub async fn get_registered_displays(&self, org_id: &str) -> DbResult<Vec<RegisteredDisplay>> {
        let rows: Vec<DisplayRow> = sqlx::query_as(
            r#"
            SELECT display_id, org_id, device_id, name, class, host, port,
                   platform, last_seen_at, online, created_at, updated_at
            FROM registered_displays
            WHERE org_id = ?1
            ORDER BY name ASC, display_id ASC
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RegisteredDisplay::try_from).collect()
    }

    /// Fetches one display by id.
    pub async fn get(&self, display_id: &str) -> DbResult<Option<RegisteredDisplay>> {
        let row: Option<DisplayRow> = sqlx::query_as(
            r#"
            SELECT display_id, org_id, device_id, name, class, host, port,
                   platform, last_seen_at, online, created_at, updated_at
            FROM registered_displays
            WHERE display_id = ?1
            "#,
        )
        .bind(display_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RegisteredDisplay::try_from).transpose()
    }

    /// Inserts a display or replaces everything but `created_at`.
    pub async fn upsert(&self, registered: &RegisteredDisplay) -> DbResult<()> {
        debug!(
            display_id = %registered.display_id,
            org_id = %registered.org_id,
            class = %registered.class,
            "Upserting registered display"
        );

        sqlx::query(
            r#"
            INSERT INTO registered_displays (
                display_id, org_id, device_id, name, class, host, port,
                platform, last_seen_at, online, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(display_id) DO UPDATE SET
                org_id       = excluded.org_id,
                device_id    = excluded.device_id,
                name         = excluded.name,
                class        = excluded.class,
                host         = excluded.host,
                port         = excluded.port,
                platform     = excluded.platform,
                last_seen_at = excluded.last_seen_at,
                online       = excluded.online,
                updated_at   = excluded.updated_at
            "#,
        )
        .bind(&registered.display_id)
        .bind(&registered.org_id)
        .bind(&registered.device_id)
        .bind(&registered.name)
        .bind(registered.class)
        .bind(&registered.host)
        .bind(i64::from(registered.port))
        .bind(&registered.platform)
        .bind(registered.last_seen_at.timestamp_millis())
        .bind(registered.online)
        .bind(registered.created_at.timestamp_millis())
        .bind(registered.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a sign of life. Returns false when the display is not
    /// registered to `org_id`.
    pub async fn touch(&self, org_id: &str, display_id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let at = at.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE registered_displays SET
                last_seen_at = MAX(last_seen_at, ?3),
                online       = 1,
                updated_at   = ?3
            WHERE org_id = ?1 AND display_id = ?2
            "#,
        )
        .bind(org_id)
        .bind(display_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records the address a display was last reached at, along with a
    /// sign of life.
    pub async fn update_address(
        &self,
        org_id: &str,
        display_id: &str,
        host: &str,
        port: u16,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let at = at.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE registered_displays SET
                host         = ?3,
                port         = ?4,
                last_seen_at = MAX(last_seen_at, ?5),
                online       = 1,
                updated_at   = ?5
            WHERE org_id = ?1 AND display_id = ?2
            "#,
        )
        .bind(org_id)
        .bind(display_id)
        .bind(host)
        .bind(i64::from(port))
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flips `online` off for every display in `org_id` silent for at least
    /// `stale_window`. Returns the number of displays that went offline.
    pub async fn mark_stale_offline(
        &self,
        org_id: &str,
        stale_window: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let window_ms = i64::try_from(stale_window.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms.saturating_sub(window_ms);

        let result = sqlx::query(
            r#"
            UPDATE registered_displays SET
                online     = 0,
                updated_at = ?3
            WHERE org_id = ?1
              AND online = 1
              AND last_seen_at <= ?2
            "#,
        )
        .bind(org_id)
        .bind(cutoff)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        let flipped = result.rows_affected();
        if flipped > 0 {
            debug!(org_id = %org_id, count = flipped, "Marked stale displays offline");
        }
        Ok(flipped)
    }

    /// Deletes a registration. Returns false if it did not exist.
    pub async fn remove(&self, org_id: &str, display_id: &str) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM registered_displays WHERE org_id = ?1 AND display_id = ?2")
                .bind(org_id)
                .bind(display_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn display(id: &str, org: &str, last_seen: DateTime<Utc>) -> RegisteredDisplay {
        RegisteredDisplay {
            display_id: id.to_string(),
            org_id: org.to_string(),
            device_id: "device-1".to_string(),
            name: format!("Display {id}"),
            class: DisplayClass::Stage,
            host: "192.168.1.20".to_string(),
            port: 3010,
            platform: "linux".to_string(),
            last_seen_at: last_seen,
            online: true,
            created_at: last_seen,
            updated_at: last_seen,
        }
    }

    async fn repo() -> DisplayRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().displays()
    }

    #[tokio::test]
    async fn test_upsert_and_list() {
        let repo = repo().await;
        repo.upsert(&display("a", "org1", at(0))).await.unwrap();
        repo.upsert(&display("b", "org1", at(0))).await.unwrap();
        repo.upsert(&display("c", "org2", at(0))).await.unwrap();

        let org1 = repo.get_registered_displays("org1").await.unwrap();
        assert_eq!(org1.len(), 2);
        assert_eq!(org1[0], display("a", "org1", at(0)));

        // Upsert keeps one row per display id and preserves created_at
        let mut renamed = display("a", "org1", at(50));
        renamed.name = "Stage Left".to_string();
        renamed.class = DisplayClass::Audience;
        repo.upsert(&renamed).await.unwrap();

        let stored = repo.get("a").await.unwrap().unwrap();
        assert_eq!(stored.name, "Stage Left");
        assert_eq!(stored.class, DisplayClass::Audience);
        assert_eq!(stored.created_at, at(0));
        assert_eq!(repo.get_registered_displays("org1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_then_heartbeat() {
        let repo = repo().await;
        repo.upsert(&display("a", "org1", at(0))).await.unwrap();
        repo.upsert(&display("b", "org1", at(20))).await.unwrap();

        // At t=30, "a" has been silent for exactly the window
        let flipped = repo
            .mark_stale_offline("org1", Duration::from_secs(30), at(30))
            .await
            .unwrap();
        assert_eq!(flipped, 1);
        assert!(!repo.get("a").await.unwrap().unwrap().online);
        assert!(repo.get("b").await.unwrap().unwrap().online);

        // Sweeping again does not count the same transition twice
        let flipped = repo
            .mark_stale_offline("org1", Duration::from_secs(30), at(31))
            .await
            .unwrap();
        assert_eq!(flipped, 0);

        assert!(repo.touch("org1", "a", at(40)).await.unwrap());
        let a = repo.get("a").await.unwrap().unwrap();
        assert!(a.online);
        assert_eq!(a.last_seen_at, at(40));
    }

    #[tokio::test]
    async fn test_touch_unknown_or_foreign_display() {
        let repo = repo().await;
        repo.upsert(&display("a", "org1", at(0))).await.unwrap();

        assert!(!repo.touch("org1", "nope", at(5)).await.unwrap());
        assert!(!repo.touch("org2", "a", at(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_address_and_remove() {
        let repo = repo().await;
        repo.upsert(&display("a", "org1", at(0))).await.unwrap();

        assert!(repo
            .update_address("org1", "a", "10.0.0.7", 4000, at(9))
            .await
            .unwrap());
        let a = repo.get("a").await.unwrap().unwrap();
        assert_eq!((a.host.as_str(), a.port), ("10.0.0.7", 4000));
        assert_eq!(a.last_seen_at, at(9));

        assert!(repo.remove("org1", "a").await.unwrap());
        assert!(!repo.remove("org1", "a").await.unwrap());
        assert!(repo.get("a").await.unwrap().is_none());
    }
}
