use std::collections::BTreeMap;

use sqlx::Row;

use cinch_core::error::{CinchError, Result};
use cinch_core::model::{ForgeType, Repo, RepoId, RepoKey, UserId};

use super::Store;

/// Fields needed to register a repository.
#[derive(Debug, Clone)]
pub struct NewRepo {
    pub key: RepoKey,
    pub clone_url: String,
    pub html_url: String,
    pub private: bool,
    pub webhook_secret: String,
    pub forge_token: String,
    pub owner_user_id: UserId,
}

impl Store {
    /// Register a repository. The webhook secret and forge token are
    /// sealed before they touch a row.
    pub async fn create_repo(&self, new: NewRepo) -> Result<Repo> {
        if new.key.forge.requires_webhook_secret() && new.webhook_secret.is_empty() {
            return Err(CinchError::Validation(format!(
                "{} requires a webhook secret",
                new.key.forge
            )));
        }

        let id = RepoId::new();
        sqlx::query(
            r#"
            INSERT INTO cinch_repos
                (id, forge, owner, name, clone_url, html_url, private,
                 webhook_secret, forge_token, owner_user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id.as_uuid())
        .bind(new.key.forge.as_str())
        .bind(&new.key.owner)
        .bind(&new.key.name)
        .bind(&new.clone_url)
        .bind(&new.html_url)
        .bind(new.private)
        .bind(self.cipher().seal(&new.webhook_secret)?)
        .bind(self.cipher().seal(&new.forge_token)?)
        .bind(new.owner_user_id.as_uuid())
        .execute(self.pool())
        .await?;

        self.get_repo(id).await
    }

    /// Look up a repository by natural key.
    pub async fn find_repo_by_key(&self, key: &RepoKey) -> Result<Option<Repo>> {
        let row = sqlx::query(
            r#"
            SELECT id, forge, owner, name, clone_url, html_url, private,
                   webhook_secret, forge_token, owner_user_id, build_command,
                   release_command, worker_labels, timeout_secs, created_at
            FROM cinch_repos
            WHERE forge = $1 AND owner = $2 AND name = $3
            "#,
        )
        .bind(key.forge.as_str())
        .bind(&key.owner)
        .bind(&key.name)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(self.repo_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    /// Get a repository by id.
    pub async fn get_repo(&self, id: RepoId) -> Result<Repo> {
        let row = sqlx::query(
            r#"
            SELECT id, forge, owner, name, clone_url, html_url, private,
                   webhook_secret, forge_token, owner_user_id, build_command,
                   release_command, worker_labels, timeout_secs, created_at
            FROM cinch_repos WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CinchError::NotFound(format!("repo {}", id)))?;

        self.repo_from_row(&row).await
    }

    /// Sync the private flag from a webhook.
    pub async fn sync_repo_private_flag(&self, id: RepoId, private: bool) -> Result<()> {
        sqlx::query("UPDATE cinch_repos SET private = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(private)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Store the commands and targeting re-parsed from the in-repo config.
    pub async fn update_repo_commands(
        &self,
        id: RepoId,
        build: Option<&str>,
        release: Option<&str>,
        worker_labels: &[Vec<String>],
        timeout_secs: Option<u64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cinch_repos
            SET build_command = $2, release_command = $3,
                worker_labels = $4, timeout_secs = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(build)
        .bind(release)
        .bind(serde_json::to_value(worker_labels)?)
        .bind(timeout_secs.map(|t| t as i64))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete a repository and everything hanging off it.
    pub async fn delete_repo(&self, id: RepoId) -> Result<()> {
        let result = sqlx::query("DELETE FROM cinch_repos WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(CinchError::NotFound(format!("repo {}", id)));
        }
        Ok(())
    }

    /// Set one repo secret, sealed at rest.
    pub async fn set_repo_secret(&self, repo_id: RepoId, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cinch_secrets (repo_id, name, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (repo_id, name) DO UPDATE SET value = $3
            "#,
        )
        .bind(repo_id.as_uuid())
        .bind(name)
        .bind(self.cipher().seal(value)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn repo_secrets(&self, repo_id: RepoId) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT name, value FROM cinch_secrets WHERE repo_id = $1")
            .bind(repo_id.as_uuid())
            .fetch_all(self.pool())
            .await?;

        let mut secrets = BTreeMap::new();
        for row in rows {
            let name: String = row.get("name");
            let stored: String = row.get("value");
            let value = self.cipher().open(&stored)?;
            if self.cipher().is_legacy_plaintext(&stored) {
                self.rewrap_secret(repo_id, &name, &value).await?;
            }
            secrets.insert(name, value);
        }
        Ok(secrets)
    }

    async fn rewrap_secret(&self, repo_id: RepoId, name: &str, value: &str) -> Result<()> {
        sqlx::query("UPDATE cinch_secrets SET value = $3 WHERE repo_id = $1 AND name = $2")
            .bind(repo_id.as_uuid())
            .bind(name)
            .bind(self.cipher().seal(value)?)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn repo_from_row(&self, row: &sqlx::postgres::PgRow) -> Result<Repo> {
        let id = RepoId::from_uuid(row.get("id"));
        let forge_str: String = row.get("forge");
        let forge = ForgeType::parse(&forge_str)
            .ok_or_else(|| CinchError::Internal(format!("unknown forge '{}'", forge_str)))?;

        let stored_secret: String = row.get("webhook_secret");
        let stored_token: String = row.get("forge_token");
        let webhook_secret = self.cipher().open(&stored_secret)?;
        let forge_token = self.cipher().open(&stored_token)?;

        // One-time migration-in for rows written before encryption.
        if self.cipher().is_legacy_plaintext(&stored_secret)
            || self.cipher().is_legacy_plaintext(&stored_token)
        {
            sqlx::query(
                "UPDATE cinch_repos SET webhook_secret = $2, forge_token = $3 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(self.cipher().seal(&webhook_secret)?)
            .bind(self.cipher().seal(&forge_token)?)
            .execute(self.pool())
            .await?;
        }

        let worker_labels: serde_json::Value = row.get("worker_labels");
        let worker_labels: Vec<Vec<String>> =
            serde_json::from_value(worker_labels).unwrap_or_default();

        Ok(Repo {
            id,
            key: RepoKey::new(forge, row.get::<String, _>("owner"), row.get::<String, _>("name")),
            clone_url: row.get("clone_url"),
            html_url: row.get("html_url"),
            private: row.get("private"),
            webhook_secret,
            forge_token,
            owner_user_id: UserId::from_uuid(row.get("owner_user_id")),
            build_command: row.get("build_command"),
            release_command: row.get("release_command"),
            worker_labels,
            timeout_secs: row.get::<Option<i64>, _>("timeout_secs").map(|t| t as u64),
            secrets: self.repo_secrets(id).await?,
            created_at: row.get("created_at"),
        })
    }
}
