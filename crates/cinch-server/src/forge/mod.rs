//! Forge adapters.
//!
//! A closed set of variants behind one capability surface: identify a
//! webhook, verify and parse it, post commit statuses, mint clone
//! credentials, and fetch the in-repo config blob. Dispatch is a sum type;
//! nothing else in the system knows forge specifics.

mod gitea;
mod github;
mod gitlab;
pub mod signature;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use cinch_core::error::{CinchError, Result};
use cinch_core::event::{StatusUpdate, WebhookEvent};
use cinch_core::model::{ForgeType, Repo, RepoKey};
use cinch_core::repoconfig::{ConfigFormat, CONFIG_FILENAMES};

/// Config filenames probed by the adapters, shared with cinch-core.
pub(crate) const CONFIG_CANDIDATES: &[(&str, ConfigFormat)] = CONFIG_FILENAMES;

/// The adapter dispatcher. One instance serves every repo; methods take
/// the repo so self-hosted instances resolve their own API base.
#[derive(Clone)]
pub struct Forge {
    http: reqwest::Client,
}

impl Forge {
    /// Build over a shared HTTP client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Which forge claims an incoming webhook, from headers alone.
    pub fn identify(headers: &HeaderMap) -> Option<ForgeType> {
        if github::identify(headers) {
            Some(ForgeType::GitHub)
        } else if gitlab::identify(headers) {
            Some(ForgeType::GitLab)
        } else if gitea::identify(headers) {
            // Codeberg runs Forgejo; the repo row disambiguates.
            Some(ForgeType::Forgejo)
        } else {
            None
        }
    }

    /// Extract the repo natural key from an unverified payload. Used only
    /// to locate the stored webhook secret; nothing is trusted until
    /// [`Forge::parse`] succeeds.
    pub fn peek_repo_key(&self, forge: ForgeType, body: &[u8]) -> Result<RepoKey> {
        match forge {
            ForgeType::GitHub => github::peek_repo_key(body),
            ForgeType::GitLab => gitlab::peek_repo_key(body),
            ForgeType::Forgejo | ForgeType::Codeberg => gitea::peek_repo_key(forge, body),
        }
    }

    /// Verify the webhook signature and parse the event. `Ok(None)` means
    /// the event is authentic but produces no job (pings, deletes,
    /// irrelevant PR actions). Signature failure is fatal for the request.
    pub fn parse(
        &self,
        forge: ForgeType,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<Option<WebhookEvent>> {
        match forge {
            ForgeType::GitHub => github::parse(headers, body, secret),
            ForgeType::GitLab => gitlab::parse(headers, body, secret),
            ForgeType::Forgejo | ForgeType::Codeberg => gitea::parse(forge, headers, body, secret),
        }
    }

    /// Best-effort POST of a commit status. Transient failures surface as
    /// [`CinchError::Upstream`] for the caller's retry policy.
    pub async fn post_status(
        &self,
        repo: &Repo,
        commit_sha: &str,
        update: &StatusUpdate,
    ) -> Result<()> {
        match repo.key.forge {
            ForgeType::GitHub => github::post_status(&self.http, repo, commit_sha, update).await,
            ForgeType::GitLab => gitlab::post_status(&self.http, repo, commit_sha, update).await,
            ForgeType::Forgejo | ForgeType::Codeberg => {
                gitea::post_status(&self.http, repo, commit_sha, update).await
            }
        }
    }

    /// Mint a short-lived clone credential for a worker. Public repos get
    /// an empty token; private repos ride the repo's forge token until the
    /// expiry the dispatcher asked for.
    pub fn clone_token(&self, repo: &Repo, ttl_secs: u64) -> (String, DateTime<Utc>) {
        let expiry = Utc::now() + ChronoDuration::seconds(ttl_secs as i64);
        if repo.private {
            (repo.forge_token.clone(), expiry)
        } else {
            (String::new(), expiry)
        }
    }

    /// Fetch the in-repo config blob at a commit, probing the candidate
    /// filenames. Best-effort: the caller falls back to stored commands.
    pub async fn fetch_config(
        &self,
        repo: &Repo,
        commit_sha: &str,
    ) -> Result<Option<(ConfigFormat, String)>> {
        match repo.key.forge {
            ForgeType::GitHub => github::fetch_config(&self.http, repo, commit_sha).await,
            ForgeType::GitLab => gitlab::fetch_config(&self.http, repo, commit_sha).await,
            ForgeType::Forgejo | ForgeType::Codeberg => {
                gitea::fetch_config(&self.http, repo, commit_sha).await
            }
        }
    }
}

/// Read a header as a str.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The scheme://host[:port] part of a URL.
pub(crate) fn url_origin(url: &str) -> Option<String> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    let path_start = rest.find('/').map(|i| scheme_end + 3 + i).unwrap_or(url.len());
    Some(url[..path_start].to_string())
}

/// Map HTTP responses onto the error taxonomy: 5xx and 429 are transient
/// and retried, other failures are final.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} returned {}: {}", what, status, body.chars().take(200).collect::<String>());

    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(CinchError::Upstream(detail))
    } else {
        Err(CinchError::Forbidden(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identify_dispatch() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        assert_eq!(Forge::identify(&headers), Some(ForgeType::GitHub));

        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", HeaderValue::from_static("Push Hook"));
        assert_eq!(Forge::identify(&headers), Some(ForgeType::GitLab));

        let mut headers = HeaderMap::new();
        headers.insert("x-forgejo-event", HeaderValue::from_static("push"));
        assert_eq!(Forge::identify(&headers), Some(ForgeType::Forgejo));

        assert_eq!(Forge::identify(&HeaderMap::new()), None);
    }

    #[test]
    fn test_url_origin() {
        assert_eq!(
            url_origin("https://codeberg.org/annie/hello").as_deref(),
            Some("https://codeberg.org")
        );
        assert_eq!(
            url_origin("http://git.local:3000/a/b").as_deref(),
            Some("http://git.local:3000")
        );
        assert_eq!(
            url_origin("https://gitlab.com").as_deref(),
            Some("https://gitlab.com")
        );
        assert_eq!(url_origin("not a url"), None);
    }

    #[test]
    fn test_clone_token_empty_for_public() {
        use chrono::Utc;
        use cinch_core::model::{RepoId, UserId};

        let mut repo = Repo {
            id: RepoId::new(),
            key: RepoKey::new(ForgeType::GitHub, "octocat", "hello"),
            clone_url: String::new(),
            html_url: String::new(),
            private: false,
            webhook_secret: String::new(),
            forge_token: "ghp_secret".to_string(),
            owner_user_id: UserId::new(),
            build_command: None,
            release_command: None,
            worker_labels: Vec::new(),
            timeout_secs: None,
            secrets: Default::default(),
            created_at: Utc::now(),
        };

        let forge = Forge::new(reqwest::Client::new());
        let (token, expiry) = forge.clone_token(&repo, 1800);
        assert!(token.is_empty());
        assert!(expiry > Utc::now());

        repo.private = true;
        let (token, _) = forge.clone_token(&repo, 1800);
        assert_eq!(token, "ghp_secret");
    }
}
