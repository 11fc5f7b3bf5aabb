//! GitLab adapter.
//!
//! GitLab does not sign webhook bodies; it sends the shared secret
//! verbatim in `X-Gitlab-Token`. Status posts go to the commit status API
//! on the instance hosting the project.

use axum::http::HeaderMap;
use serde::Deserialize;

use cinch_core::error::{CinchError, Result};
use cinch_core::event::{
    CommitState, PullRequestEvent, PushEvent, RepoEventInfo, StatusUpdate, WebhookEvent,
};
use cinch_core::model::{ForgeType, Repo, RepoKey};
use cinch_core::repoconfig::ConfigFormat;

use super::signature::verify_shared_secret;
use super::{ensure_success, header_str, url_origin, CONFIG_CANDIDATES};

#[derive(Debug, Deserialize)]
struct GlProject {
    path_with_namespace: String,
    git_http_url: String,
    web_url: String,
    #[serde(default)]
    visibility_level: i64,
}

impl GlProject {
    fn event_info(&self) -> Result<RepoEventInfo> {
        Ok(RepoEventInfo {
            key: key_from_path(&self.path_with_namespace)?,
            clone_url: self.git_http_url.clone(),
            html_url: self.web_url.clone(),
            // 0 = private, 10 = internal, 20 = public.
            private: self.visibility_level < 20,
        })
    }
}

fn key_from_path(path: &str) -> Result<RepoKey> {
    let (owner, name) = path
        .rsplit_once('/')
        .ok_or_else(|| CinchError::Validation(format!("bad project path '{}'", path)))?;
    Ok(RepoKey::new(ForgeType::GitLab, owner, name))
}

#[derive(Debug, Deserialize)]
struct GlPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    user_username: String,
    project: GlProject,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequestPayload {
    user: GlUser,
    project: GlProject,
    object_attributes: GlMergeRequest,
}

#[derive(Debug, Deserialize)]
struct GlUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: i64,
    action: Option<String>,
    source_branch: String,
    target_branch: String,
    source_project_id: i64,
    target_project_id: i64,
    last_commit: GlCommit,
}

#[derive(Debug, Deserialize)]
struct GlCommit {
    id: String,
}

/// Whether the request carries GitLab's identifying header.
pub fn identify(headers: &HeaderMap) -> bool {
    headers.contains_key("x-gitlab-event")
}

/// Verify the shared secret and parse the event.
pub fn parse(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<Option<WebhookEvent>> {
    let presented = header_str(headers, "x-gitlab-token")
        .ok_or_else(|| CinchError::Auth("missing X-Gitlab-Token".to_string()))?;
    verify_shared_secret(secret, presented)?;

    match header_str(headers, "x-gitlab-event").unwrap_or_default() {
        "Push Hook" | "Tag Push Hook" => {
            let payload: GlPushPayload = serde_json::from_slice(body)
                .map_err(|e| CinchError::Validation(format!("malformed push payload: {}", e)))?;

            if payload.after.chars().all(|c| c == '0') {
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
                repo: payload.project.event_info()?,
                commit_sha: payload.after,
                ref_name,
                is_tag,
                sender_login: payload.user_username,
            })))
        }
        "Merge Request Hook" => {
            let payload: GlMergeRequestPayload = serde_json::from_slice(body).map_err(|e| {
                CinchError::Validation(format!("malformed merge request payload: {}", e))
            })?;
            let mr = &payload.object_attributes;

            match mr.action.as_deref() {
                Some("open") | Some("update") | Some("reopen") => {}
                _ => return Ok(None),
            }

            Ok(Some(WebhookEvent::PullRequest(PullRequestEvent {
                repo: payload.project.event_info()?,
                number: mr.iid,
                commit_sha: mr.last_commit.id.clone(),
                head_ref: mr.source_branch.clone(),
                base_ref: mr.target_branch.clone(),
                is_fork: mr.source_project_id != mr.target_project_id,
                sender_login: payload.user.username,
            })))
        }
        _ => Ok(None),
    }
}

/// Repo natural key from the payload, used only to locate the secret.
pub fn peek_repo_key(body: &[u8]) -> Result<RepoKey> {
    #[derive(Deserialize)]
    struct Peek {
        project: PeekProject,
    }
    #[derive(Deserialize)]
    struct PeekProject {
        path_with_namespace: String,
    }

    let peek: Peek = serde_json::from_slice(body)
        .map_err(|e| CinchError::Validation(format!("unreadable payload: {}", e)))?;
    key_from_path(&peek.project.path_with_namespace)
}

fn api_base(repo: &Repo) -> Result<String> {
    let origin = url_origin(&repo.html_url).ok_or_else(|| {
        CinchError::Internal(format!("cannot derive API base from {}", repo.html_url))
    })?;
    Ok(format!("{}/api/v4", origin))
}

fn project_path(repo: &Repo) -> String {
    // URL-encode the owner/name path segment.
    repo.key.full_name().replace('/', "%2F")
}

fn state_str(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "pending",
        CommitState::Running => "running",
        CommitState::Success => "success",
        CommitState::Failure | CommitState::Error => "failed",
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
        "{}/projects/{}/statuses/{}",
        api_base(repo)?,
        project_path(repo),
        commit_sha
    );

    let response = http
        .post(&url)
        .header("private-token", &repo.forge_token)
        .json(&serde_json::json!({
            "state": state_str(update.state),
            "description": update.description,
            "target_url": update.target_url,
            "name": update.context,
        }))
        .send()
        .await
        .map_err(|e| CinchError::Upstream(format!("gitlab status post: {}", e)))?;

    ensure_success(response, "gitlab status post").await?;
    Ok(())
}

/// Fetch the in-repo config blob at a commit, if any.
pub async fn fetch_config(
    http: &reqwest::Client,
    repo: &Repo,
    commit_sha: &str,
) -> Result<Option<(ConfigFormat, String)>> {
    let base = api_base(repo)?;
    for (filename, format) in CONFIG_CANDIDATES {
        let url = format!(
            "{}/projects/{}/repository/files/{}/raw?ref={}",
            base,
            project_path(repo),
            filename,
            commit_sha
        );

        let response = http
            .get(&url)
            .header("private-token", &repo.forge_token)
            .send()
            .await
            .map_err(|e| CinchError::Upstream(format!("gitlab config fetch: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            continue;
        }
        let response = ensure_success(response, "gitlab config fetch").await?;
        let text = response
            .text()
            .await
            .map_err(|e| CinchError::Upstream(format!("gitlab config body: {}", e)))?;
        return Ok(Some((*format, text)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "lab-secret";

    fn push_body() -> Vec<u8> {
        serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc1234",
            "user_username": "dev",
            "project": {
                "path_with_namespace": "group/hello",
                "git_http_url": "https://gitlab.com/group/hello.git",
                "web_url": "https://gitlab.com/group/hello",
                "visibility_level": 20
            }
        })
        .to_string()
        .into_bytes()
    }

    fn headers(event: &str, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", HeaderValue::from_str(event).unwrap());
        headers.insert("x-gitlab-token", HeaderValue::from_str(token).unwrap());
        headers
    }

    #[test]
    fn test_parse_push() {
        let body = push_body();
        let event = parse(&headers("Push Hook", SECRET), &body, SECRET)
            .unwrap()
            .unwrap();
        match event {
            WebhookEvent::Push(push) => {
                assert_eq!(push.repo.key.forge, ForgeType::GitLab);
                assert_eq!(push.repo.key.owner, "group");
                assert!(!push.repo.private);
                assert_eq!(push.sender_login, "dev");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_token_rejected() {
        let body = push_body();
        let err = parse(&headers("Push Hook", "wrong"), &body, SECRET).unwrap_err();
        assert!(matches!(err, CinchError::Auth(_)));
    }

    #[test]
    fn test_fork_merge_request() {
        let body = serde_json::json!({
            "user": {"username": "outsider"},
            "project": {
                "path_with_namespace": "group/hello",
                "git_http_url": "https://gitlab.com/group/hello.git",
                "web_url": "https://gitlab.com/group/hello",
                "visibility_level": 0
            },
            "object_attributes": {
                "iid": 3,
                "action": "open",
                "source_branch": "fix",
                "target_branch": "main",
                "source_project_id": 99,
                "target_project_id": 42,
                "last_commit": {"id": "fedcba9"}
            }
        })
        .to_string()
        .into_bytes();

        let event = parse(&headers("Merge Request Hook", SECRET), &body, SECRET)
            .unwrap()
            .unwrap();
        match event {
            WebhookEvent::PullRequest(pr) => {
                assert!(pr.is_fork);
                assert_eq!(pr.number, 3);
                assert!(pr.repo.private);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(state_str(CommitState::Running), "running");
        assert_eq!(state_str(CommitState::Failure), "failed");
        assert_eq!(state_str(CommitState::Error), "failed");
    }

    #[test]
    fn test_peek_repo_key() {
        let key = peek_repo_key(&push_body()).unwrap();
        assert_eq!(key.full_name(), "group/hello");
    }
}
