use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repo::ForgeType;

/// Unique user identifier. Every authorization check resolves to this;
/// forge usernames are per-link attributes and never compared across forges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Generate a new random user ID.
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

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An account on the control plane.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique user ID.
    pub id: UserId,
    /// Canonical verified email.
    pub email: String,
    /// Display name.
    pub display_name: String,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// A linked identity on one forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeIdentity {
    /// The forge this identity lives on.
    pub forge: ForgeType,
    /// Login name on that forge.
    pub login: String,
    /// Whether the forge instance is operated by a third party we trust to
    /// have verified the email. Self-hosted instances are not, so their
    /// email claims never auto-bind to existing accounts.
    pub email_trusted: bool,
}

impl ForgeIdentity {
    /// Whether an email claim from this identity may bind to an existing
    /// account during linking.
    pub fn may_bind_by_email(&self) -> bool {
        self.email_trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrusted_identity_never_binds() {
        let identity = ForgeIdentity {
            forge: ForgeType::Forgejo,
            login: "mallory".to_string(),
            email_trusted: false,
        };
        assert!(!identity.may_bind_by_email());
    }
}
