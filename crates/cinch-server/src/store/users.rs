use sqlx::Row;

use cinch_core::error::{CinchError, Result};
use cinch_core::model::{ForgeType, User, UserId};

use super::Store;

impl Store {
    /// Create a user with a verified email.
    pub async fn create_user(&self, email: &str, display_name: &str) -> Result<User> {
        let id = UserId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO cinch_users (id, email, display_name)
            VALUES ($1, $2, $3)
            RETURNING id, email, display_name, created_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(email)
        .bind(display_name)
        .fetch_one(self.pool())
        .await?;

        Ok(user_from_row(&row))
    }

    /// Get a user by id.
    pub async fn get_user(&self, id: UserId) -> Result<User> {
        let row = sqlx::query(
            "SELECT id, email, display_name, created_at FROM cinch_users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CinchError::NotFound(format!("user {}", id)))?;

        Ok(user_from_row(&row))
    }

    /// Resolve a forge login to a user through a linked identity.
    ///
    /// Authorization always resolves through user ids; logins are only
    /// meaningful within one forge.
    pub async fn find_user_by_identity(
        &self,
        forge: ForgeType,
        login: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.email, u.display_name, u.created_at
            FROM cinch_users u
            JOIN cinch_forge_identities i ON i.user_id = u.id
            WHERE i.forge = $1 AND i.login = $2
            "#,
        )
        .bind(forge.as_str())
        .bind(login)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| user_from_row(&r)))
    }

    /// Link a forge identity to a user.
    pub async fn link_identity(
        &self,
        user_id: UserId,
        forge: ForgeType,
        login: &str,
        email_trusted: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cinch_forge_identities (user_id, forge, login, email_trusted)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (forge, login) DO UPDATE SET user_id = $1, email_trusted = $4
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(forge.as_str())
        .bind(login)
        .bind(email_trusted)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> User {
    User {
        id: UserId::from_uuid(row.get("id")),
        email: row.get("email"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    }
}
