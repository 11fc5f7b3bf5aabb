use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use cinch_core::error::Result;
use cinch_core::model::{JobId, LogChunk, LogStream};

use crate::logbus::{BoxFuture, LogStore};

/// Durable log store over the cinch_log_chunks / cinch_log_index tables.
#[derive(Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
}

impl PostgresLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LogStore for PostgresLogStore {
    fn append(&self, chunk: LogChunk) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO cinch_log_chunks (job_id, attempt, stream, ts_ms, data)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(chunk.job_id.as_uuid())
            .bind(chunk.attempt)
            .bind(chunk.stream.as_str())
            .bind(chunk.ts_ms)
            .bind(&chunk.data)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn finalize(&self, job_id: JobId, attempt: i32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO cinch_log_index (job_id, attempt, finalized)
                VALUES ($1, $2, TRUE)
                ON CONFLICT (job_id, attempt) DO UPDATE SET finalized = TRUE
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn read(&self, job_id: JobId, attempt: Option<i32>) -> BoxFuture<'_, Result<Vec<LogChunk>>> {
        Box::pin(async move {
            let rows = match attempt {
                Some(attempt) => {
                    sqlx::query(
                        r#"
                        SELECT job_id, attempt, stream, ts_ms, data
                        FROM cinch_log_chunks
                        WHERE job_id = $1 AND attempt = $2
                        ORDER BY seq ASC
                        "#,
                    )
                    .bind(job_id.as_uuid())
                    .bind(attempt)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query(
                        r#"
                        SELECT job_id, attempt, stream, ts_ms, data
                        FROM cinch_log_chunks
                        WHERE job_id = $1
                        ORDER BY seq ASC
                        "#,
                    )
                    .bind(job_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await?
                }
            };

            Ok(rows
                .iter()
                .map(|row| LogChunk {
                    job_id: JobId::from_uuid(row.get("job_id")),
                    attempt: row.get("attempt"),
                    stream: LogStream::parse(row.get::<String, _>("stream").as_str())
                        .unwrap_or(LogStream::Stdout),
                    ts_ms: row.get("ts_ms"),
                    data: row.get("data"),
                })
                .collect())
        })
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                DELETE FROM cinch_log_chunks c
                USING cinch_log_index i
                WHERE i.job_id = c.job_id AND i.attempt = c.attempt
                  AND i.finalized = TRUE AND i.created_at < $1
                "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "DELETE FROM cinch_log_index WHERE finalized = TRUE AND created_at < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        })
    }
}
