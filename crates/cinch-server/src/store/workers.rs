use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;

use cinch_core::error::Result;
use cinch_core::model::{
    TokenId, UserId, WorkerId, WorkerMode, WorkerRegistration, WorkerStatus,
};

use super::Store;

/// Persisted worker facts, as shown in listings.
#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub id: WorkerId,
    pub token_id: TokenId,
    pub owner_user_id: UserId,
    pub name: String,
    pub hostname: String,
    pub labels: BTreeSet<String>,
    pub mode: WorkerMode,
    pub concurrency: u32,
    pub version: String,
    pub status: WorkerStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Find the worker row for a credential, creating it on first
    /// registration. The worker id is stable for the credential's life;
    /// re-registration refreshes the advertised facts.
    pub async fn register_worker(
        &self,
        token_id: TokenId,
        owner: UserId,
        registration: &WorkerRegistration,
    ) -> Result<WorkerId> {
        let labels = serde_json::to_value(registration.labels.iter().collect::<Vec<_>>())?;

        let existing: Option<(uuid::Uuid,)> =
            sqlx::query_as("SELECT id FROM cinch_workers WHERE token_id = $1")
                .bind(token_id.as_uuid())
                .fetch_optional(self.pool())
                .await?;

        if let Some((id,)) = existing {
            sqlx::query(
                r#"
                UPDATE cinch_workers
                SET name = $2, hostname = $3, labels = $4, mode = $5,
                    concurrency = $6, version = $7, status = 'online',
                    last_seen_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&registration.name)
            .bind(&registration.hostname)
            .bind(&labels)
            .bind(registration.mode.as_str())
            .bind(registration.concurrency as i32)
            .bind(&registration.version)
            .execute(self.pool())
            .await?;

            return Ok(WorkerId::from_uuid(id));
        }

        let id = WorkerId::new();
        sqlx::query(
            r#"
            INSERT INTO cinch_workers
                (id, token_id, owner_user_id, name, hostname, labels, mode,
                 concurrency, version, status, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'online', NOW())
            "#,
        )
        .bind(id.as_uuid())
        .bind(token_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(&registration.name)
        .bind(&registration.hostname)
        .bind(&labels)
        .bind(registration.mode.as_str())
        .bind(registration.concurrency as i32)
        .bind(&registration.version)
        .execute(self.pool())
        .await?;

        Ok(id)
    }

    /// Record a heartbeat.
    pub async fn touch_worker(&self, id: WorkerId) -> Result<()> {
        sqlx::query("UPDATE cinch_workers SET last_seen_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a worker's status.
    pub async fn set_worker_status(&self, id: WorkerId, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE cinch_workers SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// List all persisted workers.
    pub async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, token_id, owner_user_id, name, hostname, labels, mode,
                   concurrency, version, status, last_seen_at
            FROM cinch_workers
            ORDER BY name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(worker_from_row).collect())
    }

    /// Remove offline workers not seen since the cutoff. Returns how many
    /// rows were deleted.
    pub async fn delete_stale_workers(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM cinch_workers
            WHERE status = 'offline'
              AND (last_seen_at IS NULL OR last_seen_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> WorkerRow {
    let labels: serde_json::Value = row.get("labels");
    let labels: BTreeSet<String> = serde_json::from_value(labels).unwrap_or_default();

    WorkerRow {
        id: WorkerId::from_uuid(row.get("id")),
        token_id: TokenId::from_uuid(row.get("token_id")),
        owner_user_id: UserId::from_uuid(row.get("owner_user_id")),
        name: row.get("name"),
        hostname: row.get("hostname"),
        labels,
        mode: WorkerMode::parse(row.get::<String, _>("mode").as_str())
            .unwrap_or(WorkerMode::Personal),
        concurrency: row.get::<i32, _>("concurrency") as u32,
        version: row.get("version"),
        status: WorkerStatus::parse(row.get::<String, _>("status").as_str()),
        last_seen_at: row.get("last_seen_at"),
    }
}
