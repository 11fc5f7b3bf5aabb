//! Webhook ingress.
//!
//! Locates the adapter, looks up the repo, verifies and parses the event
//! (no state mutation before parse succeeds), computes trust, materializes
//! the job, and wakes the dispatcher. Webhooks for the same repo are
//! serialized so rapid pushes cannot interleave command re-parsing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use tokio::sync::Mutex;

use cinch_core::error::{CinchError, Result};
use cinch_core::event::{CommitState, StatusUpdate, WebhookEvent};
use cinch_core::model::{
    ForgeType, Job, JobId, JobStatus, RefType, Repo, RepoId, RepoKey, TrustLevel,
};
use cinch_core::repoconfig::RepoBuildConfig;

use crate::dispatch::{DispatcherHandle, StatusPoster, StatusTask};
use crate::forge::Forge;
use crate::store::{NewJob, Store};

/// What an authentic webhook produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// A job row exists and (unless held for approval) is queued.
    Accepted { job_id: JobId },
    /// Authentic but no job: ping, delete, irrelevant action, or a tag
    /// push without a release command.
    Ignored,
}

/// Webhook intake shared by the HTTP gateway and the relay client.
pub struct Ingress {
    store: Store,
    forge: Forge,
    dispatcher: DispatcherHandle,
    status: StatusPoster,
    default_timeout_secs: u64,
    external_url: String,
    repo_locks: Mutex<HashMap<RepoId, Arc<Mutex<()>>>>,
}

impl Ingress {
    pub fn new(
        store: Store,
        forge: Forge,
        dispatcher: DispatcherHandle,
        status: StatusPoster,
        default_timeout_secs: u64,
        external_url: String,
    ) -> Self {
        Self {
            store,
            forge,
            dispatcher,
            status,
            default_timeout_secs,
            external_url,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one webhook delivery.
    pub async fn handle_webhook(
        &self,
        forge_hint: Option<ForgeType>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngressOutcome> {
        let forge_type = forge_hint
            .or_else(|| Forge::identify(headers))
            .ok_or_else(|| CinchError::Validation("no adapter claims this webhook".to_string()))?;

        // The key is read from the unverified payload purely to find the
        // stored secret; nothing else is trusted until parse succeeds.
        let key = self.forge.peek_repo_key(forge_type, body)?;
        let repo = self.lookup_repo(&key).await?;

        // Serialize deliveries per repo.
        let lock = self.repo_lock(repo.id).await;
        let _guard = lock.lock().await;

        let event = self
            .forge
            .parse(repo.key.forge, headers, body, &repo.webhook_secret)?;
        let Some(event) = event else {
            return Ok(IngressOutcome::Ignored);
        };

        // Parse succeeded; mutations may begin.
        if event.repo().private != repo.private {
            self.store
                .sync_repo_private_flag(repo.id, event.repo().private)
                .await?;
        }

        let config = self.load_repo_config(&repo, event.commit_sha()).await?;

        let (ref_type, ref_name, pr_number, base_branch, is_fork) = match &event {
            WebhookEvent::Push(push) => {
                let ref_type = if push.is_tag {
                    RefType::Tag
                } else {
                    RefType::Branch
                };
                (ref_type, push.ref_name.clone(), None, None, false)
            }
            WebhookEvent::PullRequest(pr) => (
                RefType::PullRequest,
                pr.head_ref.clone(),
                Some(pr.number),
                Some(pr.base_ref.clone()),
                pr.is_fork,
            ),
        };

        let Some(build_command) = self.resolve_command(&repo, config.as_ref(), ref_type)? else {
            // A tag push with no release command is not an error.
            return Ok(IngressOutcome::Ignored);
        };

        let trust = self.compute_trust(&repo, &event, is_fork).await;

        let timeout_secs = config
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .or(repo.timeout_secs)
            .unwrap_or(self.default_timeout_secs);

        let job = self
            .store
            .create_job(NewJob {
                repo_id: repo.id,
                commit_sha: event.commit_sha().to_string(),
                ref_type,
                ref_name,
                pr_number,
                base_branch,
                author: event.sender_login().to_string(),
                build_command,
                services: config.map(|c| c.services).unwrap_or_default(),
                trust,
                is_fork,
                timeout_secs,
            })
            .await?;

        self.post_pending_status(&job);

        if job.status == JobStatus::Pending {
            self.dispatcher.enqueue_job(job.id);
        } else {
            tracing::info!(job_id = %job.id, "External job held for approval");
        }

        Ok(IngressOutcome::Accepted { job_id: job.id })
    }

    async fn lookup_repo(&self, key: &RepoKey) -> Result<Repo> {
        if let Some(repo) = self.store.find_repo_by_key(key).await? {
            return Ok(repo);
        }

        // Codeberg is hosted Forgejo; a header-identified delivery may
        // belong to a repo registered under either name.
        if key.forge == ForgeType::Forgejo {
            let alt = RepoKey::new(ForgeType::Codeberg, key.owner.clone(), key.name.clone());
            if let Some(repo) = self.store.find_repo_by_key(&alt).await? {
                return Ok(repo);
            }
        }

        // Auto-creation is the forge app installation flow, which lives
        // outside the dispatch core; unknown repos are rejected.
        Err(CinchError::NotFound(format!("repo {}", key)))
    }

    /// Fetch and parse the in-repo config at the event's commit. Fetch
    /// failures fall back to stored commands; a config that parses but is
    /// invalid rejects the delivery.
    async fn load_repo_config(
        &self,
        repo: &Repo,
        commit_sha: &str,
    ) -> Result<Option<RepoBuildConfig>> {
        let blob = match self.forge.fetch_config(repo, commit_sha).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(repo = %repo.key, "Config fetch failed, using stored commands: {}", e);
                return Ok(None);
            }
        };

        let Some((format, text)) = blob else {
            return Ok(None);
        };

        let config = RepoBuildConfig::parse(format, &text)?;

        self.store
            .update_repo_commands(
                repo.id,
                Some(config.build.as_str()),
                config.release.as_deref(),
                &config.workers,
                config.timeout_secs,
            )
            .await?;

        Ok(Some(config))
    }

    fn resolve_command(
        &self,
        repo: &Repo,
        config: Option<&RepoBuildConfig>,
        ref_type: RefType,
    ) -> Result<Option<String>> {
        if let Some(config) = config {
            return Ok(config.command_for(ref_type).map(str::to_string));
        }

        // No config at this commit; fall back to the stored commands.
        let stored = match ref_type {
            RefType::Tag => repo.release_command.clone(),
            RefType::Branch | RefType::PullRequest => repo.build_command.clone(),
        };

        match (ref_type, stored) {
            (_, Some(command)) => Ok(Some(command)),
            (RefType::Tag, None) => Ok(None),
            (_, None) => Err(CinchError::Validation(format!(
                "repo {} has no build command",
                repo.key
            ))),
        }
    }

    /// Trust is resolved through user ids, never by comparing logins
    /// across forges: the sender's linked identity must map to the repo
    /// owner's user id to count as the owner.
    async fn compute_trust(&self, repo: &Repo, event: &WebhookEvent, is_fork: bool) -> TrustLevel {
        let sender_user = self
            .store
            .find_user_by_identity(repo.key.forge, event.sender_login())
            .await
            .ok()
            .flatten();
        let is_owner = sender_user
            .map(|user| user.id == repo.owner_user_id)
            .unwrap_or(false);

        match event {
            WebhookEvent::Push(_) => {
                if is_owner {
                    TrustLevel::Owner
                } else {
                    // The forge only delivers pushes from accounts with
                    // push rights.
                    TrustLevel::Collaborator
                }
            }
            WebhookEvent::PullRequest(_) => {
                if is_fork {
                    TrustLevel::External
                } else if is_owner {
                    TrustLevel::Owner
                } else {
                    TrustLevel::Collaborator
                }
            }
        }
    }

    fn post_pending_status(&self, job: &Job) {
        let description = match job.status {
            JobStatus::PendingContributor => "build awaiting approval",
            _ => "build queued",
        };
        let target_url = format!(
            "{}/jobs/{}",
            self.external_url.trim_end_matches('/'),
            job.id
        );
        self.status.enqueue(StatusTask {
            job_id: job.id,
            repo_id: job.repo_id,
            commit_sha: job.commit_sha.clone(),
            update: StatusUpdate::new(CommitState::Pending, description, target_url),
        });
    }

    async fn repo_lock(&self, repo_id: RepoId) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks.entry(repo_id).or_default().clone()
    }
}
