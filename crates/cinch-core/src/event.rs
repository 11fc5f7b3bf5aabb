//! Forge-neutral webhook events.
//!
//! Adapters parse forge-specific payloads into these shapes; nothing
//! downstream of ingress knows which forge a job came from.

use serde::{Deserialize, Serialize};

use crate::model::RepoKey;

/// Repository facts carried by every webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEventInfo {
    /// Natural key on the forge.
    pub key: RepoKey,
    /// Git clone URL.
    pub clone_url: String,
    /// Web URL for humans.
    pub html_url: String,
    /// Whether the repo is private on the forge.
    pub private: bool,
}

/// A push to a branch or tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo: RepoEventInfo,
    /// Head commit of the push.
    pub commit_sha: String,
    /// Branch or tag name, ref prefix stripped.
    pub ref_name: String,
    /// Whether the ref is a tag.
    pub is_tag: bool,
    /// Forge login of the pusher.
    pub sender_login: String,
}

/// A pull request opened or updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub repo: RepoEventInfo,
    /// PR number on the forge.
    pub number: i64,
    /// Head commit of the PR.
    pub commit_sha: String,
    /// Head branch name.
    pub head_ref: String,
    /// Base branch name.
    pub base_ref: String,
    /// Whether the head lives in a different repository.
    pub is_fork: bool,
    /// Forge login of the PR author.
    pub sender_login: String,
}

/// Any event the ingress acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
}

impl WebhookEvent {
    /// Repository facts for the event.
    pub fn repo(&self) -> &RepoEventInfo {
        match self {
            Self::Push(e) => &e.repo,
            Self::PullRequest(e) => &e.repo,
        }
    }

    /// Commit the event builds.
    pub fn commit_sha(&self) -> &str {
        match self {
            Self::Push(e) => &e.commit_sha,
            Self::PullRequest(e) => &e.commit_sha,
        }
    }

    /// Forge login of whoever triggered the event.
    pub fn sender_login(&self) -> &str {
        match self {
            Self::Push(e) => &e.sender_login,
            Self::PullRequest(e) => &e.sender_login,
        }
    }
}

/// Commit status state reported back to the forge. Adapters map this to
/// the forge's native vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Running,
    Success,
    Failure,
    Error,
}

impl CommitState {
    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

/// A status post destined for a forge commit status API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: CommitState,
    /// Human description, e.g. "build succeeded in 42s".
    pub description: String,
    /// Link back to the job page.
    pub target_url: String,
    /// Status context; defaults to "cinch".
    pub context: String,
}

impl StatusUpdate {
    pub fn new(state: CommitState, description: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            state,
            description: description.into(),
            target_url: target_url.into(),
            context: "cinch".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForgeType;

    #[test]
    fn test_event_accessors() {
        let event = WebhookEvent::Push(PushEvent {
            repo: RepoEventInfo {
                key: RepoKey::new(ForgeType::GitHub, "octocat", "hello"),
                clone_url: "https://github.com/octocat/hello.git".to_string(),
                html_url: "https://github.com/octocat/hello".to_string(),
                private: false,
            },
            commit_sha: "abc1234".to_string(),
            ref_name: "main".to_string(),
            is_tag: false,
            sender_login: "octocat".to_string(),
        });

        assert_eq!(event.commit_sha(), "abc1234");
        assert_eq!(event.sender_login(), "octocat");
        assert_eq!(event.repo().key.full_name(), "octocat/hello");
    }

    #[test]
    fn test_status_update_default_context() {
        let update = StatusUpdate::new(CommitState::Pending, "queued", "https://ci/jobs/1");
        assert_eq!(update.context, "cinch");
        assert_eq!(update.state.as_str(), "pending");
    }
}
