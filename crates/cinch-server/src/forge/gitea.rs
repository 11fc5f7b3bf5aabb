//! Gitea-family adapter: Forgejo instances and Codeberg (hosted Forgejo).
//!
//! The webhook payloads track GitHub's shape closely; the API lives under
//! `/api/v1` on the instance that hosts the repo.

use axum::http::HeaderMap;
use serde::Deserialize;

use cinch_core::error::{CinchError, Result};
use cinch_core::event::{
    CommitState, PullRequestEvent, PushEvent, RepoEventInfo, StatusUpdate, WebhookEvent,
};
use cinch_core::model::{ForgeType, Repo, RepoKey};
use cinch_core::repoconfig::ConfigFormat;

use super::signature::verify_hmac_sha256;
use super::{ensure_success, header_str, url_origin, CONFIG_CANDIDATES};

#[derive(Debug, Deserialize)]
struct GtAccount {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GtRepository {
    name: String,
    full_name: String,
    private: bool,
    clone_url: String,
    html_url: String,
    owner: GtAccount,
}

impl GtRepository {
    fn event_info(&self, forge: ForgeType) -> RepoEventInfo {
        RepoEventInfo {
            key: RepoKey::new(forge, self.owner.login.clone(), self.name.clone()),
            clone_url: self.clone_url.clone(),
            html_url: self.html_url.clone(),
            private: self.private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: GtRepository,
    sender: GtAccount,
}

#[derive(Debug, Deserialize)]
struct GtPullRequestPayload {
    action: String,
    number: i64,
    pull_request: GtPullRequest,
    repository: GtRepository,
    sender: GtAccount,
}

#[derive(Debug, Deserialize)]
struct GtPullRequest {
    head: GtPrRef,
    base: GtPrRef,
}

#[derive(Debug, Deserialize)]
struct GtPrRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
    repo: Option<GtPrRepo>,
}

#[derive(Debug, Deserialize)]
struct GtPrRepo {
    full_name: String,
}

/// Whether the request carries a Forgejo/Gitea identifying header.
pub fn identify(headers: &HeaderMap) -> bool {
    headers.contains_key("x-forgejo-event") || headers.contains_key("x-gitea-event")
}

fn event_name(headers: &HeaderMap) -> &str {
    header_str(headers, "x-forgejo-event")
        .or_else(|| header_str(headers, "x-gitea-event"))
        .unwrap_or_default()
}

fn signature<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    header_str(headers, "x-forgejo-signature").or_else(|| header_str(headers, "x-gitea-signature"))
}

/// Verify the signature and parse the event.
pub fn parse(
    forge: ForgeType,
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<Option<WebhookEvent>> {
    let signature = signature(headers)
        .ok_or_else(|| CinchError::Auth("missing webhook signature".to_string()))?;
    verify_hmac_sha256(secret, body, signature)?;

    match event_name(headers) {
        "push" => {
            let payload: GtPushPayload = serde_json::from_slice(body)
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
                repo: payload.repository.event_info(forge),
                commit_sha: payload.after,
                ref_name,
                is_tag,
                sender_login: payload.sender.login,
            })))
        }
        "pull_request" => {
            let payload: GtPullRequestPayload = serde_json::from_slice(body).map_err(|e| {
                CinchError::Validation(format!("malformed pull_request payload: {}", e))
            })?;

            if !matches!(payload.action.as_str(), "opened" | "synchronized" | "reopened") {
                return Ok(None);
            }

            let is_fork = payload
                .pull_request
                .head
                .repo
                .as_ref()
                .map(|r| r.full_name != payload.repository.full_name)
                .unwrap_or(true);

            Ok(Some(WebhookEvent::PullRequest(PullRequestEvent {
                repo: payload.repository.event_info(forge),
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

/// Repo natural key from the payload, used only to locate the secret.
pub fn peek_repo_key(forge: ForgeType, body: &[u8]) -> Result<RepoKey> {
    #[derive(Deserialize)]
    struct Peek {
        repository: PeekRepo,
    }
    #[derive(Deserialize)]
    struct PeekRepo {
        name: String,
        owner: GtAccount,
    }

    let peek: Peek = serde_json::from_slice(body)
        .map_err(|e| CinchError::Validation(format!("unreadable payload: {}", e)))?;
    Ok(RepoKey::new(
        forge,
        peek.repository.owner.login,
        peek.repository.name,
    ))
}

fn api_base(repo: &Repo) -> Result<String> {
    let origin = url_origin(&repo.html_url).ok_or_else(|| {
        CinchError::Internal(format!("cannot derive API base from {}", repo.html_url))
    })?;
    Ok(format!("{}/api/v1", origin))
}

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
        api_base(repo)?,
        repo.key.full_name(),
        commit_sha
    );

    let response = http
        .post(&url)
        .header("authorization", format!("token {}", repo.forge_token))
        .json(&serde_json::json!({
            "state": state_str(update.state),
            "description": update.description,
            "target_url": update.target_url,
            "context": update.context,
        }))
        .send()
        .await
        .map_err(|e| CinchError::Upstream(format!("forgejo status post: {}", e)))?;

    ensure_success(response, "forgejo status post").await?;
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
            "{}/repos/{}/raw/{}?ref={}",
            base,
            repo.key.full_name(),
            filename,
            commit_sha
        );

        let response = http
            .get(&url)
            .header("authorization", format!("token {}", repo.forge_token))
            .send()
            .await
            .map_err(|e| CinchError::Upstream(format!("forgejo config fetch: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            continue;
        }
        let response = ensure_success(response, "forgejo config fetch").await?;
        let text = response
            .text()
            .await
            .map_err(|e| CinchError::Upstream(format!("forgejo config body: {}", e)))?;
        return Ok(Some((*format, text)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::signature::sign_hmac_sha256;
    use axum::http::HeaderValue;

    const SECRET: &str = "berg-secret";

    fn push_body() -> Vec<u8> {
        serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc1234",
            "repository": {
                "name": "hello",
                "full_name": "annie/hello",
                "private": true,
                "clone_url": "https://codeberg.org/annie/hello.git",
                "html_url": "https://codeberg.org/annie/hello",
                "owner": {"login": "annie"}
            },
            "sender": {"login": "annie"}
        })
        .to_string()
        .into_bytes()
    }

    fn signed_headers(event: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forgejo-event", HeaderValue::from_str(event).unwrap());
        let sig = sign_hmac_sha256(SECRET, body);
        headers.insert("x-forgejo-signature", HeaderValue::from_str(&sig).unwrap());
        headers
    }

    #[test]
    fn test_identify_both_header_families() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitea-event", HeaderValue::from_static("push"));
        assert!(identify(&headers));
        assert!(identify(&signed_headers("push", b"{}")));
        assert!(!identify(&HeaderMap::new()));
    }

    #[test]
    fn test_parse_push() {
        let body = push_body();
        let event = parse(ForgeType::Codeberg, &signed_headers("push", &body), &body, SECRET)
            .unwrap()
            .unwrap();
        match event {
            WebhookEvent::Push(push) => {
                assert_eq!(push.repo.key.forge, ForgeType::Codeberg);
                assert_eq!(push.commit_sha, "abc1234");
                assert!(push.repo.private);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_signature_without_prefix() {
        // Forgejo sends the bare hex digest, no sha256= prefix.
        let body = push_body();
        let headers = signed_headers("push", &body);
        let sig = headers.get("x-forgejo-signature").unwrap().to_str().unwrap();
        assert!(!sig.starts_with("sha256="));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let body = push_body();
        let mut headers = signed_headers("push", &body);
        headers.insert(
            "x-forgejo-signature",
            HeaderValue::from_str(&sign_hmac_sha256("wrong", &body)).unwrap(),
        );
        assert!(matches!(
            parse(ForgeType::Codeberg, &headers, &body, SECRET),
            Err(CinchError::Auth(_))
        ));
    }

    #[test]
    fn test_api_base_derived_from_html_url() {
        use chrono::Utc;
        use cinch_core::model::{RepoId, UserId};

        let repo = Repo {
            id: RepoId::new(),
            key: RepoKey::new(ForgeType::Forgejo, "annie", "hello"),
            clone_url: "https://git.example.org/annie/hello.git".to_string(),
            html_url: "https://git.example.org/annie/hello".to_string(),
            private: false,
            webhook_secret: String::new(),
            forge_token: String::new(),
            owner_user_id: UserId::new(),
            build_command: None,
            release_command: None,
            worker_labels: Vec::new(),
            timeout_secs: None,
            secrets: Default::default(),
            created_at: Utc::now(),
        };
        assert_eq!(api_base(&repo).unwrap(), "https://git.example.org/api/v1");
    }
}
