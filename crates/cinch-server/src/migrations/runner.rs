//! Migration runner with mesh-safe locking.
//!
//! Ensures only one control-plane node runs migrations at a time using a
//! PostgreSQL advisory lock.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use cinch_core::error::{CinchError, Result};

/// Lock ID for the migration advisory lock ("CINCH" in hex).
const MIGRATION_LOCK_ID: i64 = 0x43494E4348;

/// A single forward migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique name, e.g. "0000_cinch_internal".
    pub name: String,
    /// SQL to execute.
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Applies pending migrations in order.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations under the advisory lock.
    pub async fn run(&self, extra: Vec<Migration>) -> Result<()> {
        self.acquire_lock().await?;

        let result = self.run_inner(extra).await;

        // Always release the lock, even on error.
        if let Err(e) = self.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    async fn run_inner(&self, extra: Vec<Migration>) -> Result<()> {
        self.ensure_migrations_table().await?;

        let applied = self.get_applied().await?;
        debug!("Already applied migrations: {:?}", applied);

        for migration in super::builtin::get_builtin_migrations() {
            if !applied.contains(&migration.name) {
                self.apply(&migration).await?;
            }
        }

        for migration in extra {
            if !applied.contains(&migration.name) {
                self.apply(&migration).await?;
            }
        }

        Ok(())
    }

    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock...");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::Database(format!("Failed to acquire migration lock: {}", e)))?;
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| CinchError::Database(format!("Failed to release migration lock: {}", e)))?;
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cinch_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CinchError::Database(format!("Failed to create migrations table: {}", e)))?;

        Ok(())
    }

    async fn get_applied(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM cinch_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CinchError::Database(format!("Failed to get applied migrations: {}", e)))?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        info!("Applying migration: {}", migration.name);

        for statement in split_sql_statements(&migration.sql) {
            sqlx::query(&statement).execute(&self.pool).await.map_err(|e| {
                CinchError::Database(format!(
                    "Failed to apply migration '{}': {}",
                    migration.name, e
                ))
            })?;
        }

        sqlx::query("INSERT INTO cinch_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                CinchError::Database(format!(
                    "Failed to record migration '{}': {}",
                    migration.name, e
                ))
            })?;

        info!("Migration applied: {}", migration.name);
        Ok(())
    }
}

/// Split plain SQL into statements. The internal schema contains no
/// dollar-quoted bodies, so a semicolon split suffices.
fn split_sql_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| {
            !s.is_empty()
                && !s.lines().all(|l| {
                    let l = l.trim();
                    l.is_empty() || l.starts_with("--")
                })
        })
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_sql_statements("SELECT 1; SELECT 2; SELECT 3;");
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "SELECT 1");
    }

    #[test]
    fn test_split_skips_comment_only_blocks() {
        let stmts = split_sql_statements("-- header comment\n;SELECT 1;");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0], "SELECT 1");
    }

    #[test]
    fn test_builtin_schema_splits() {
        let migrations = super::super::builtin::get_builtin_migrations();
        let stmts = split_sql_statements(&migrations[0].sql);
        assert!(stmts.len() > 5);
        assert!(stmts.iter().all(|s| !s.contains("$$")));
    }
}
