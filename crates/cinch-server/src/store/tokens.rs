use chrono::{DateTime, Utc};
use sqlx::Row;

use cinch_core::error::{CinchError, Result};
use cinch_core::model::{TokenId, UserId, WorkerToken};

use crate::crypto::{self, IssuedToken};

use super::Store;

impl Store {
    /// Issue a new worker credential. The returned plaintext is shown to
    /// the caller once and never persisted.
    pub async fn create_worker_token(
        &self,
        name: &str,
        owner: UserId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(WorkerToken, String)> {
        let IssuedToken {
            id,
            plaintext,
            salt_hex,
            hash_hex,
        } = crypto::issue_token();

        let row = sqlx::query(
            r#"
            INSERT INTO cinch_tokens (id, name, owner_user_id, token_hash, salt, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, owner_user_id, token_hash, salt, created_at, expires_at, revoked
            "#,
        )
        .bind(id.as_uuid())
        .bind(name)
        .bind(owner.as_uuid())
        .bind(&hash_hex)
        .bind(&salt_hex)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await?;

        Ok((token_from_row(&row), plaintext))
    }

    /// Authenticate a presented worker credential: look up the embedded
    /// token id, hash with the stored salt, and compare in constant time.
    pub async fn authenticate_worker_token(&self, plaintext: &str) -> Result<WorkerToken> {
        let id = crypto::token_id_of(plaintext)
            .ok_or_else(|| CinchError::Auth("malformed worker token".to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT id, name, owner_user_id, token_hash, salt, created_at, expires_at, revoked
            FROM cinch_tokens WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CinchError::Auth("unknown worker token".to_string()))?;

        let token = token_from_row(&row);

        let presented = crypto::hash_token(plaintext, &token.salt);
        if !crypto::digest_eq(&presented, &token.token_hash) {
            return Err(CinchError::Auth("invalid worker token".to_string()));
        }
        if !token.is_usable(Utc::now()) {
            return Err(CinchError::Auth("worker token revoked or expired".to_string()));
        }

        Ok(token)
    }

    /// Revoke a token.
    pub async fn revoke_token(&self, id: TokenId) -> Result<()> {
        let result = sqlx::query("UPDATE cinch_tokens SET revoked = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(CinchError::NotFound(format!("token {}", id)));
        }
        Ok(())
    }

    /// Mark tokens past their expiry as revoked. Returns how many changed.
    pub async fn sweep_expired_tokens(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cinch_tokens
            SET revoked = TRUE
            WHERE revoked = FALSE AND expires_at IS NOT NULL AND expires_at < NOW()
            "#,
        )
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

fn token_from_row(row: &sqlx::postgres::PgRow) -> WorkerToken {
    WorkerToken {
        id: TokenId::from_uuid(row.get("id")),
        name: row.get("name"),
        owner_user_id: UserId::from_uuid(row.get("owner_user_id")),
        token_hash: row.get("token_hash"),
        salt: row.get("salt"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
    }
}
