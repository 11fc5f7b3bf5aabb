use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::user::UserId;

/// Unique repository identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId(pub Uuid);

impl RepoId {
    /// Generate a new random repo ID.
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

impl Default for RepoId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Forge hosting a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeType {
    GitHub,
    GitLab,
    Forgejo,
    Codeberg,
}

impl ForgeType {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Forgejo => "forgejo",
            Self::Codeberg => "codeberg",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::GitHub),
            "gitlab" => Some(Self::GitLab),
            "forgejo" | "gitea" => Some(Self::Forgejo),
            "codeberg" => Some(Self::Codeberg),
            _ => None,
        }
    }

    /// Whether this forge signs webhook payloads with HMAC-SHA256.
    ///
    /// GitLab instead sends the shared secret verbatim in a header.
    pub fn uses_hmac_signature(&self) -> bool {
        !matches!(self, Self::GitLab)
    }

    /// Whether a webhook secret is mandatory for this forge.
    pub fn requires_webhook_secret(&self) -> bool {
        true
    }
}

impl std::fmt::Display for ForgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a repository: forge + owner + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    pub forge: ForgeType,
    pub owner: String,
    pub name: String,
}

impl RepoKey {
    pub fn new(forge: ForgeType, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            forge,
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// The `owner/name` slug as forges render it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.forge, self.owner, self.name)
    }
}

/// A registered repository.
#[derive(Debug, Clone)]
pub struct Repo {
    /// Unique repo ID.
    pub id: RepoId,
    /// Natural key on the forge.
    pub key: RepoKey,
    /// Git clone URL.
    pub clone_url: String,
    /// Web URL for humans.
    pub html_url: String,
    /// Whether the repo is private on the forge.
    pub private: bool,
    /// Webhook secret, decrypted. Empty only for forges that allow it.
    pub webhook_secret: String,
    /// Forge API token used for status posts and clone credentials, decrypted.
    pub forge_token: String,
    /// Owning user.
    pub owner_user_id: UserId,
    /// Command run for branch pushes and pull requests.
    pub build_command: Option<String>,
    /// Command run for tag pushes.
    pub release_command: Option<String>,
    /// Label tuples for targeted dispatch; empty means any worker.
    pub worker_labels: Vec<Vec<String>>,
    /// Per-repo job timeout override in seconds.
    pub timeout_secs: Option<u64>,
    /// Secrets exposed to the worker environment, decrypted values.
    pub secrets: BTreeMap<String, String>,
    /// When the repo was first registered.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forge_type_roundtrip() {
        for forge in [
            ForgeType::GitHub,
            ForgeType::GitLab,
            ForgeType::Forgejo,
            ForgeType::Codeberg,
        ] {
            assert_eq!(ForgeType::parse(forge.as_str()), Some(forge));
        }
        assert_eq!(ForgeType::parse("sourcehut"), None);
    }

    #[test]
    fn test_gitea_alias_maps_to_forgejo() {
        assert_eq!(ForgeType::parse("gitea"), Some(ForgeType::Forgejo));
    }

    #[test]
    fn test_signature_scheme() {
        assert!(ForgeType::GitHub.uses_hmac_signature());
        assert!(ForgeType::Codeberg.uses_hmac_signature());
        assert!(!ForgeType::GitLab.uses_hmac_signature());
    }

    #[test]
    fn test_repo_key_display() {
        let key = RepoKey::new(ForgeType::GitHub, "octocat", "hello-world");
        assert_eq!(key.to_string(), "github:octocat/hello-world");
        assert_eq!(key.full_name(), "octocat/hello-world");
    }
}
