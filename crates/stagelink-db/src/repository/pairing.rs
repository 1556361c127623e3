//! # Pairing Record Repository
//!
//! Pending pairing codes, keyed by `(org_id, code)`. A code is consumed by
//! [`PairingRepository::take`], which reads and deletes it in one
//! transaction so two controllers racing on the same code cannot both win.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use stagelink_core::PairingRecord;

use super::{from_millis, to_port};
use crate::error::{DbError, DbResult};

const TABLE: &str = "pairing_records";

#[derive(Debug, sqlx::FromRow)]
struct PairingRow {
    org_id: String,
    code: String,
    display_id: String,
    device_id: String,
    name: String,
    host: String,
    port: i64,
    platform: String,
    created_at: i64,
    expires_at: i64,
}

impl TryFrom<PairingRow> for PairingRecord {
    type Error = DbError;

    fn try_from(row: PairingRow) -> Result<Self, Self::Error> {
        Ok(PairingRecord {
            port: to_port(TABLE, row.port)?,
            created_at: from_millis(TABLE, "created_at", row.created_at)?,
            expires_at: from_millis(TABLE, "expires_at", row.expires_at)?,
            code: row.code,
            org_id: row.org_id,
            display_id: row.display_id,
            device_id: row.device_id,
            name: row.name,
            host: row.host,
            platform: row.platform,
        })
    }
}

/// Repository for pending pairings.
#[derive(Debug, Clone)]
pub struct PairingRepository {
    pool: SqlitePool,
}

impl PairingRepository {
    /// Creates a new PairingRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PairingRepository { pool }
    }

    /// Stores a pending pairing.
    ///
    /// ## Errors
    /// `DbError::UniqueViolation` if the code is already pending for the
    /// same organization.
    pub async fn insert(&self, record: &PairingRecord) -> DbResult<()> {
        debug!(
            org_id = %record.org_id,
            display_id = %record.display_id,
            "Storing pending pairing"
        );

        sqlx::query(
            r#"
            INSERT INTO pairing_records (
                org_id, code, display_id, device_id, name, host, port,
                platform, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.org_id)
        .bind(&record.code)
        .bind(&record.display_id)
        .bind(&record.device_id)
        .bind(&record.name)
        .bind(&record.host)
        .bind(i64::from(record.port))
        .bind(&record.platform)
        .bind(record.created_at.timestamp_millis())
        .bind(record.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: record.code.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    /// Looks up a pending pairing without consuming it.
    pub async fn get(&self, org_id: &str, code: &str) -> DbResult<Option<PairingRecord>> {
        let row: Option<PairingRow> = sqlx::query_as(
            r#"
            SELECT org_id, code, display_id, device_id, name, host, port,
                   platform, created_at, expires_at
            FROM pairing_records
            WHERE org_id = ?1 AND code = ?2
            "#,
        )
        .bind(org_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PairingRecord::try_from).transpose()
    }

    /// Removes and returns a pending pairing. Expired records are returned
    /// too; the caller decides what expiry means.
    pub async fn take(&self, org_id: &str, code: &str) -> DbResult<Option<PairingRecord>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<PairingRow> = sqlx::query_as(
            r#"
            SELECT org_id, code, display_id, device_id, name, host, port,
                   platform, created_at, expires_at
            FROM pairing_records
            WHERE org_id = ?1 AND code = ?2
            "#,
        )
        .bind(org_id)
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        if row.is_some() {
            sqlx::query("DELETE FROM pairing_records WHERE org_id = ?1 AND code = ?2")
                .bind(org_id)
                .bind(code)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        row.map(PairingRecord::try_from).transpose()
    }

    /// Deletes a pending pairing. Returns false if it did not exist.
    pub async fn delete(&self, org_id: &str, code: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM pairing_records WHERE org_id = ?1 AND code = ?2")
            .bind(org_id)
            .bind(code)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes every record whose expiry is at or before `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM pairing_records WHERE expires_at <= ?1")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::TimeZone;
    use stagelink_core::DeviceDescriptor;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn record(code: &str, org: &str, created: DateTime<Utc>) -> PairingRecord {
        let device = DeviceDescriptor {
            display_id: "display-1".into(),
            device_id: "device-1".into(),
            name: "Lobby".into(),
            host: "192.168.1.50".into(),
            port: 3010,
            platform: "linux".into(),
            resolution: Some("1920x1080".into()),
        };
        PairingRecord::new(code, org, &device, created, Duration::from_secs(300))
    }

    async fn repo() -> PairingRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().pairings()
    }

    #[tokio::test]
    async fn test_take_is_one_shot() {
        let repo = repo().await;
        let rec = record("ABC234", "org1", at(0));
        repo.insert(&rec).await.unwrap();

        assert_eq!(repo.get("org1", "ABC234").await.unwrap(), Some(rec.clone()));
        assert_eq!(repo.take("org1", "ABC234").await.unwrap(), Some(rec));
        assert_eq!(repo.take("org1", "ABC234").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_code_in_same_org() {
        let repo = repo().await;
        repo.insert(&record("ABC234", "org1", at(0))).await.unwrap();

        let err = repo.insert(&record("ABC234", "org1", at(1))).await.unwrap_err();
        assert!(err.is_unique_violation());

        // Same code in another org is fine
        repo.insert(&record("ABC234", "org2", at(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let repo = repo().await;
        repo.insert(&record("AAAAAA", "org1", at(0))).await.unwrap();
        repo.insert(&record("BBBBBB", "org1", at(200))).await.unwrap();

        assert_eq!(repo.purge_expired(at(300)).await.unwrap(), 1);
        assert!(repo.get("org1", "AAAAAA").await.unwrap().is_none());
        assert!(repo.get("org1", "BBBBBB").await.unwrap().is_some());

        assert!(repo.delete("org1", "BBBBBB").await.unwrap());
        assert!(!repo.delete("org1", "BBBBBB").await.unwrap());
    }
}
