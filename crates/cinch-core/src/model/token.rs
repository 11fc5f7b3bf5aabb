use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::user::UserId;

/// Unique worker credential identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    /// Generate a new random token ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker credential row. The plaintext is shown once at issuance and
/// only the salted SHA3-256 hash is kept.
#[derive(Debug, Clone)]
pub struct WorkerToken {
    /// Unique token ID.
    pub id: TokenId,
    /// Display name chosen at issuance.
    pub name: String,
    /// Owning user.
    pub owner_user_id: UserId,
    /// Hex-encoded salted SHA3-256 digest of the plaintext.
    pub token_hash: String,
    /// Hex-encoded per-token salt.
    pub salt: String,
    /// When the token was issued.
    pub created_at: DateTime<Utc>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the token has been revoked.
    pub revoked: bool,
}

impl WorkerToken {
    /// Whether the token can authenticate a connection at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}
