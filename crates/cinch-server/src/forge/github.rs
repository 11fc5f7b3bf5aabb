//! GitHub adapter.

use axum::http::HeaderMap;
use serde::Deserialize;

use cinch_core::error::{CinchError, Result};
use cinch_core::event::{
    CommitState, PullRequestEvent, PushEvent, RepoEventInfo, StatusUpdate, WebhookEvent,
};
use cinch_core::model::{ForgeType, Repo, RepoKey};
use cinch_core::repoconfig::ConfigFormat;

use super::signature::verify_hmac_sha256;
use super::{ensure_success, header_str, CONFIG_CANDIDATES};

const API_BASE: &str = "https://api.github.com";

/// PR actions that trigger a build.
const BUILD_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

#[derive(Debug, Deserialize)]
struct GhAccount {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepository {
    name: String,
    full_name: String,
    private: bool,
    clone_url: String,
    html_url: String,
    owner: GhAccount,
}

impl GhRepository {
    fn event_info(&self) -> RepoEventInfo {
        RepoEventInfo {
            key: RepoKey::new(ForgeType::GitHub, self.owner.login.clone(), self.name.clone()),
            clone_url: self.clone_url.clone(),
            html_url: self.html_url.clone(),
            private: self.private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: GhRepository,
    sender: GhAccount,
}

#[derive(Debug, Deserialize)]
struct GhPullRequestPayload {
    action: String,
    number: i64,
    pull_request: GhPullRequest,
    repository: GhRepository,
    sender: GhAccount,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    head: GhPrRef,
    base: GhPrRef,
}

#[derive(Debug, Deserialize)]
struct GhPrRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
    repo: Option<GhPrRepo>,
}

#[derive(Debug, Deserialize)]
struct GhPrRepo {
    full_name: String,
}

/// Whether the request carries GitHub's identifying header.
pub fn identify(headers: &HeaderMap) -> bool {
    headers.contains_key("x-github-event")
}

/// Verify the signature and parse the event. Events that should not
/// produce a job (pings, deletes, irrelevant PR actions) come back as None.
pub fn parse(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<Option<WebhookEvent>> {
    let signature = header_str(headers, "x-hub-signature-256")
        .ok_or_else(|| CinchError::Auth("missing X-Hub-Signature-256".to_string()))?;
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, signature)?;

    let event = header_str(headers, "x-github-event").unwrap_or_default();
    match event {
        "push" => {
            let payload: GhPushPayload = serde_json::from_slice(body)
                .map_err(|e| CinchError::Validation(format!("malformed push payload: {}", e)))?;

            // Branch deletions push an all-zero head.
            if payload.deleted || payload.after.chars().all(|c| c == '0') {
                return Ok(None);
            }

            let (ref_name, is_tag) = if let Some(tag) = payload.git_ref.strip_prefix("refs/tags/")
            {
                (tag.to_string(), true)
            } else if let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") {
                (branch.to_string(), false)
            } else {
                return Ok(None);
            };

            Ok(Some(WebhookEvent::Push(PushEvent {
                repo: payload.repository.event_info(),
                commit_sha: payload.after,
                ref_name,
                is_tag,
                sender_login: payload.sender.login,
            })))
        }
        "pull_request" => {
            let payload: GhPullRequestPayload = serde_json::from_slice(body).map_err(|e| {
                CinchError::Validation(format!("malformed pull_request payload: {}", e))
            })?;

            if !BUILD_ACTIONS.contains(&payload.action.as_str()) {
                return Ok(None);
            }

            // A missing head repo means it was deleted out from under the
            // PR; treat it like a fork and let trust gating handle it.
            let is_fork = payload
                .pull_request
                .head
                .repo
                .as_ref()
                .map(|r| r.full_name != payload.repository.full_name)
                .unwrap_or(true);

            Ok(Some(WebhookEvent::PullRequest(PullRequestEvent {
                repo: payload.repository.event_info(),
                number: payload.number,
                commit_sha: payload.pull_request.head.sha,
                head_ref: payload.pull_request.head.name,
                base_ref: payload.pull_request.base.name,
                is_fork,
                sender_login: payload.sender.login,
            })))
        }
        _ => Ok(None),
    }
}

/// Repo natural key from the payload, read before signature verification
/// purely to locate the stored secret. Never trusted beyond the lookup.
pub fn peek_repo_key(body: &[u8]) -> Result<RepoKey> {
    #[derive(Deserialize)]
    struct Peek {
        repository: PeekRepo,
    }
    #[derive(Deserialize)]
    struct PeekRepo {
        name: String,
        owner: GhAccount,
    }

    let peek: Peek = serde_json::from_slice(body)
        .map_err(|e| CinchError::Validation(format!("unreadable payload: {}", e)))?;
    Ok(RepoKey::new(
        ForgeType::GitHub,
        peek.repository.owner.login,
        peek.repository.name,
    ))
}

/// Map to GitHub's status vocabulary; it has no "running" state.
fn state_str(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending | CommitState::Running => "pending",
        CommitState::Success => "success",
        CommitState::Failure => "failure",
        CommitState::Error => "error",
    }
}

/// POST a commit status.
pub async fn post_status(
    http: &reqwest::Client,
    repo: &Repo,
    commit_sha: &str,
    update: &StatusUpdate,
) -> Result<()> {
    let url = format!(
        "{}/repos/{}/statuses/{}",
        API_BASE,
        repo.key.full_name(),
        commit_sha
    );

    let response = http
        .post(&url)
        .bearer_auth(&repo.forge_token)
        .header("accept", "application/vnd.github+json")
        .json(&serde_json::json!({
            "state": state_str(update.state),
            "description": update.description,
            "target_url": update.target_url,
            "context": update.context,
        }))
        .send()
        .await
        .map_err(|e| CinchError::Upstream(format!("github status post: {}", e)))?;

    ensure_success(response, "github status post").await?;
    Ok(())
}

/// Fetch the in-repo config blob at a commit, if any.
pub async fn fetch_config(
    http: &reqwest::Client,
    repo: &Repo,
    commit_sha: &str,
) -> Result<Option<(ConfigFormat, String)>> {
    for (filename, format) in CONFIG_CANDIDATES {
        let url = format!(
            "{}/repos/{}/contents/{}?ref={}",
            API_BASE,
            repo.key.full_name(),
            filename,
            commit_sha
        );

        let response = http
            .get(&url)
            .bearer_auth(&repo.forge_token)
            .header("accept", "application/vnd.github.raw+json")
            .send()
            .await
            .map_err(|e| CinchError::Upstream(format!("github config fetch: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            continue;
        }
        let response = ensure_success(response, "github config fetch").await?;
        let text = response
            .text()
            .await
            .map_err(|e| CinchError::Upstream(format!("github config body: {}", e)))?;
        return Ok(Some((*format, text)));
    }
    Ok(None)
}
