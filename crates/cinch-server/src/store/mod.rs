//! Durable state: users, tokens, repos, workers, jobs, secrets, logs.
//!
//! Every multi-row job transition runs in a single transaction; the store
//! is the serialization point for durable state. Sensitive columns pass
//! through the [`SecretCipher`] on read and write.

mod jobs;
mod logs;
mod repos;
mod tokens;
mod users;
mod workers;

pub use jobs::{CancelOutcome, NewJob, RequeueOutcome};
pub use logs::PostgresLogStore;
pub use repos::NewRepo;
pub use workers::WorkerRow;

use sqlx::PgPool;

use crate::crypto::SecretCipher;

/// Handle to the durable store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    cipher: SecretCipher,
}

impl Store {
    /// Create a new store over a connection pool.
    pub fn new(pool: PgPool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The at-rest cipher.
    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_creation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");
        let _store = Store::new(pool, SecretCipher::disabled());
    }
}
