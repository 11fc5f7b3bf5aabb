//! The scheduling core.
//!
//! A single scheduler task owns the ready queue and performs every
//! assignment, so no two assignments can race to the same job. It wakes on
//! events (enqueue, worker registered or gone, completion, timeout,
//! cancel), reads a hub snapshot, runs the matcher, and performs the
//! transactional transition before recording the assignment in the hub.
//! It never blocks on forge or store I/O while holding hub locks.

mod matcher;
mod queue;
mod status;

pub use matcher::{available, labels_allow, select_worker, trust_allows};
pub use queue::ReadyQueue;
pub use status::{StatusPoster, StatusTask};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cinch_core::config::DispatchConfig;
use cinch_core::error::CinchError;
use cinch_core::event::{CommitState, StatusUpdate};
use cinch_core::model::{Job, JobId, JobOutcome, JobStatus, RefType, WorkerId};
use cinch_core::protocol::{JobEnvelope, JobRef, RepoEnvelope, ServerMessage};

use crate::hub::{HubEvent, WorkerHub, WorkerSnapshot};
use crate::logbus::LogBus;
use crate::forge::Forge;
use crate::store::{RequeueOutcome, Store};

/// Wake events for the scheduler.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A job entered PENDING (webhook, approval, retry, startup recovery).
    JobEnqueued(JobId),
    /// A user asked for a cancel.
    CancelRequested(JobId),
    /// A worker reported COMPLETE or ERROR.
    Completion {
        worker_id: WorkerId,
        job_id: JobId,
        outcome: JobOutcome,
    },
    /// The job timeout elapsed; issue CANCEL and start the grace period.
    TimeoutFired { job_id: JobId, attempt: i32 },
    /// The grace period elapsed; force the job terminal.
    TimeoutForce { job_id: JobId, attempt: i32 },
}

/// Cheap cloneable handle for feeding the scheduler.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl DispatcherHandle {
    /// Wake the scheduler for a newly dispatchable job.
    pub fn enqueue_job(&self, job_id: JobId) {
        let _ = self.tx.send(DispatchEvent::JobEnqueued(job_id));
    }

    /// Request a cancel.
    pub fn cancel_job(&self, job_id: JobId) {
        let _ = self.tx.send(DispatchEvent::CancelRequested(job_id));
    }

    /// Deliver a worker-reported completion.
    pub fn report_completion(&self, worker_id: WorkerId, job_id: JobId, outcome: JobOutcome) {
        let _ = self.tx.send(DispatchEvent::Completion {
            worker_id,
            job_id,
            outcome,
        });
    }
}

enum AssignResult {
    Assigned,
    NoWorker,
    Remove,
}

/// The scheduler.
pub struct Dispatcher {
    store: Store,
    hub: Arc<WorkerHub>,
    hub_events: mpsc::UnboundedReceiver<HubEvent>,
    logbus: Arc<LogBus>,
    forge: Forge,
    status: StatusPoster,
    config: DispatchConfig,
    external_url: String,
    queue: ReadyQueue,
    timers: HashMap<JobId, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<DispatchEvent>,
    rx: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        hub: Arc<WorkerHub>,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
        logbus: Arc<LogBus>,
        forge: Forge,
        status: StatusPoster,
        config: DispatchConfig,
        external_url: String,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle { tx: tx.clone() };
        (
            Self {
                store,
                hub,
                hub_events,
                logbus,
                forge,
                status,
                config,
                external_url,
                queue: ReadyQueue::new(),
                timers: HashMap::new(),
                tx,
                rx,
            },
            handle,
        )
    }

    /// Run the scheduler until shutdown. Recovers the ready queue from the
    /// store first so PENDING jobs survive a restart, and returns jobs a
    /// previous process left RUNNING to the queue.
    pub async fn run(mut self, shutdown: CancellationToken) {
        match self.store.recover_interrupted_jobs().await {
            Ok(ids) if !ids.is_empty() => {
                tracing::info!(jobs = ids.len(), "Recovered interrupted running jobs");
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to recover interrupted jobs: {}", e),
        }

        match self.store.list_pending_job_ids().await {
            Ok(ids) => {
                for id in ids {
                    self.queue.push_back(id);
                }
                if !self.queue.is_empty() {
                    tracing::info!(jobs = self.queue.len(), "Recovered pending jobs");
                }
            }
            Err(e) => tracing::error!("Failed to recover pending jobs: {}", e),
        }
        self.schedule_pass().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                Some(event) = self.rx.recv() => {
                    self.handle_event(event).await;
                }
                Some(event) = self.hub_events.recv() => {
                    self.handle_hub_event(event).await;
                }
                else => break,
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    async fn handle_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::JobEnqueued(job_id) => {
                self.queue.push_back(job_id);
                self.schedule_pass().await;
            }
            DispatchEvent::CancelRequested(job_id) => {
                self.handle_cancel(job_id).await;
            }
            DispatchEvent::Completion {
                worker_id,
                job_id,
                outcome,
            } => {
                self.handle_completion(worker_id, job_id, outcome).await;
            }
            DispatchEvent::TimeoutFired { job_id, attempt } => {
                self.handle_timeout_fired(job_id, attempt).await;
            }
            DispatchEvent::TimeoutForce { job_id, attempt } => {
                self.handle_timeout_force(job_id, attempt).await;
            }
        }
    }

    async fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::WorkerRegistered { worker_id } => {
                tracing::debug!(%worker_id, "Worker available; scheduling");
                self.schedule_pass().await;
            }
            HubEvent::WorkerGone {
                worker_id,
                in_flight,
            } => {
                self.handle_worker_gone(worker_id, in_flight).await;
            }
        }
    }

    /// Scan the queue head-to-tail and assign whatever matches. Jobs with
    /// no eligible worker stay in place; the pass never blocks on them.
    async fn schedule_pass(&mut self) {
        let mut workers = self.hub.snapshot().await;

        for job_id in self.queue.ids() {
            match self.try_assign(job_id, &mut workers).await {
                AssignResult::Assigned | AssignResult::Remove => {
                    self.queue.remove(job_id);
                }
                AssignResult::NoWorker => {}
            }
        }
    }

    async fn try_assign(&mut self, job_id: JobId, workers: &mut [WorkerSnapshot]) -> AssignResult {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(CinchError::NotFound(_)) => return AssignResult::Remove,
            Err(e) => {
                tracing::warn!(%job_id, "Cannot load job for assignment: {}", e);
                return AssignResult::NoWorker;
            }
        };
        if job.status != JobStatus::Pending {
            return AssignResult::Remove;
        }

        let repo = match self.store.get_repo(job.repo_id).await {
            Ok(repo) => repo,
            Err(e) => {
                tracing::warn!(%job_id, "Cannot load repo for assignment: {}", e);
                return AssignResult::NoWorker;
            }
        };

        let Some(picked) =
            select_worker(job.trust, repo.owner_user_id, &repo.worker_labels, workers)
        else {
            return AssignResult::NoWorker;
        };
        let worker_id = picked.worker_id;

        let attempt = match self.store.mark_job_running(job_id, worker_id).await {
            Ok(attempt) => attempt,
            Err(CinchError::Conflict(_)) => return AssignResult::Remove,
            Err(e) => {
                tracing::warn!(%job_id, "Failed to mark job running: {}", e);
                return AssignResult::NoWorker;
            }
        };

        if !self.hub.assign(worker_id, job_id).await {
            // The worker vanished between snapshot and assignment.
            self.rollback_assignment(job_id, worker_id).await;
            return AssignResult::NoWorker;
        }

        let (clone_token, _expiry) = self.forge.clone_token(
            &repo,
            job.timeout_secs + self.config.clone_token_margin_secs,
        );

        let envelope = JobEnvelope {
            job_id,
            attempt,
            repo: RepoEnvelope {
                clone_url: repo.clone_url.clone(),
                commit_sha: job.commit_sha.clone(),
                reference: job_ref(&job),
                clone_token,
            },
            build_command: job.build_command.clone(),
            timeout_secs: job.timeout_secs,
            env: HashMap::new(),
            services: job.services.clone(),
            // Fork and external submissions never see repo secrets.
            secrets: if job.trust == cinch_core::model::TrustLevel::External {
                HashMap::new()
            } else {
                repo.secrets.clone().into_iter().collect()
            },
        };

        if !self
            .hub
            .send(worker_id, ServerMessage::Assign(Box::new(envelope)))
            .await
        {
            self.hub.unassign(worker_id, job_id).await;
            self.rollback_assignment(job_id, worker_id).await;
            return AssignResult::NoWorker;
        }

        if let Some(snapshot) = workers.iter_mut().find(|w| w.worker_id == worker_id) {
            snapshot.in_flight += 1;
            snapshot.last_assigned_at = Some(chrono::Utc::now());
        }

        self.start_timeout_timer(job_id, attempt, job.timeout_secs);

        tracing::info!(
            %job_id,
            %worker_id,
            attempt,
            commit = %job.commit_sha,
            "Job assigned"
        );
        AssignResult::Assigned
    }

    async fn rollback_assignment(&mut self, job_id: JobId, worker_id: WorkerId) {
        match self
            .store
            .requeue_lost_job(job_id, worker_id, self.config.max_attempts)
            .await
        {
            Ok(RequeueOutcome::Requeued { .. }) | Ok(RequeueOutcome::NotRunning) => {}
            Ok(RequeueOutcome::Escalated) => {
                self.finish_terminal(job_id).await;
                self.queue.remove(job_id);
            }
            Err(e) => tracing::error!(%job_id, "Failed to roll back assignment: {}", e),
        }
    }

    async fn handle_completion(&mut self, worker_id: WorkerId, job_id: JobId, outcome: JobOutcome) {
        // Authenticate the claim against the live assignment set; forged
        // or stale completions produce no state transition.
        if !self.hub.is_assigned(worker_id, job_id).await {
            tracing::warn!(%worker_id, %job_id, "Dropping completion for unassigned job");
            return;
        }

        match self.store.complete_job(job_id, worker_id, &outcome).await {
            Ok(()) => {}
            Err(CinchError::Conflict(_)) => {
                tracing::debug!(%job_id, "Ignoring late completion");
                return;
            }
            Err(e) => {
                tracing::error!(%job_id, "Failed to record completion: {}", e);
                return;
            }
        }

        self.hub.unassign(worker_id, job_id).await;
        self.abort_timer(job_id);
        self.finish_terminal(job_id).await;
        self.schedule_pass().await;
    }

    async fn handle_worker_gone(&mut self, worker_id: WorkerId, in_flight: Vec<JobId>) {
        if let Err(e) = self
            .store
            .set_worker_status(worker_id, cinch_core::model::WorkerStatus::Offline)
            .await
        {
            tracing::warn!(%worker_id, "Failed to mark worker offline: {}", e);
        }

        for job_id in in_flight {
            self.abort_timer(job_id);
            match self
                .store
                .requeue_lost_job(job_id, worker_id, self.config.max_attempts)
                .await
            {
                Ok(RequeueOutcome::Requeued { attempt }) => {
                    tracing::info!(%job_id, attempt, "Re-queued job after worker loss");
                    self.queue.push_front(job_id);
                }
                Ok(RequeueOutcome::Escalated) => {
                    tracing::warn!(%job_id, "Job exhausted its attempts after worker loss");
                    self.finish_terminal(job_id).await;
                }
                Ok(RequeueOutcome::NotRunning) => {}
                Err(e) => tracing::error!(%job_id, "Failed to re-queue lost job: {}", e),
            }
        }

        self.schedule_pass().await;
    }

    async fn handle_cancel(&mut self, job_id: JobId) {
        match self.store.cancel_job(job_id).await {
            Ok(crate::store::CancelOutcome::WasQueued) => {
                self.queue.remove(job_id);
                self.finish_terminal(job_id).await;
            }
            Ok(crate::store::CancelOutcome::WasRunning { worker_id }) => {
                self.hub.send(worker_id, ServerMessage::Cancel { job_id }).await;
                self.hub.unassign(worker_id, job_id).await;
                self.abort_timer(job_id);
                self.finish_terminal(job_id).await;
                self.schedule_pass().await;
            }
            Err(e) => tracing::debug!(%job_id, "Cancel request rejected: {}", e),
        }
    }

    async fn handle_timeout_fired(&mut self, job_id: JobId, attempt: i32) {
        self.timers.remove(&job_id);

        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(_) => return,
        };
        if job.status != JobStatus::Running || job.attempt != attempt {
            return;
        }

        if let Some(worker_id) = job.assigned_worker_id {
            tracing::warn!(%job_id, "Job timed out; sending CANCEL");
            self.hub.send(worker_id, ServerMessage::Cancel { job_id }).await;
        }

        let tx = self.tx.clone();
        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(DispatchEvent::TimeoutForce { job_id, attempt });
        });
    }

    async fn handle_timeout_force(&mut self, job_id: JobId, attempt: i32) {
        match self.store.timeout_job(job_id, attempt).await {
            Ok(Some(worker_id)) => {
                self.hub.unassign(worker_id, job_id).await;
                self.finish_terminal(job_id).await;
                self.schedule_pass().await;
            }
            // Completed (or was re-queued) during the grace period.
            Ok(None) => {}
            Err(e) => tracing::error!(%job_id, "Failed to time out job: {}", e),
        }
    }

    /// Post the terminal status and close the log topic for a job that
    /// just reached a terminal state.
    async fn finish_terminal(&mut self, job_id: JobId) {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(%job_id, "Cannot load job for terminal handling: {}", e);
                return;
            }
        };

        self.status.enqueue(StatusTask {
            job_id,
            repo_id: job.repo_id,
            commit_sha: job.commit_sha.clone(),
            update: terminal_update(&job, &self.external_url),
        });

        if let Err(e) = self.logbus.close_job(job_id, job.attempt, job.status).await {
            tracing::warn!(%job_id, "Failed to close log topic: {}", e);
        }
    }

    fn start_timeout_timer(&mut self, job_id: JobId, attempt: i32, timeout_secs: u64) {
        self.abort_timer(job_id);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            let _ = tx.send(DispatchEvent::TimeoutFired { job_id, attempt });
        });
        self.timers.insert(job_id, handle);
    }

    fn abort_timer(&mut self, job_id: JobId) {
        if let Some(timer) = self.timers.remove(&job_id) {
            timer.abort();
        }
    }
}

fn job_ref(job: &Job) -> JobRef {
    match job.ref_type {
        RefType::Branch => JobRef::Branch {
            name: job.ref_name.clone(),
        },
        RefType::Tag => JobRef::Tag {
            name: job.ref_name.clone(),
        },
        RefType::PullRequest => JobRef::PullRequest {
            number: job.pr_number.unwrap_or(0),
            base: job.base_branch.clone().unwrap_or_default(),
        },
    }
}

/// Map a terminal job onto the forge status vocabulary.
fn terminal_update(job: &Job, external_url: &str) -> StatusUpdate {
    let target_url = format!("{}/jobs/{}", external_url.trim_end_matches('/'), job.id);
    match job.status {
        JobStatus::Success => {
            let secs = job.duration_ms.unwrap_or(0) / 1000;
            StatusUpdate::new(
                CommitState::Success,
                format!("build succeeded in {}s", secs),
                target_url,
            )
        }
        JobStatus::Failed => StatusUpdate::new(
            CommitState::Failure,
            format!("build failed with exit code {}", job.exit_code.unwrap_or(-1)),
            target_url,
        ),
        _ => {
            let description = match job.error_phase {
                Some(phase) => format!("build error ({})", phase.as_str()),
                None => "build error".to_string(),
            };
            StatusUpdate::new(CommitState::Error, description, target_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cinch_core::model::{ErrorPhase, RepoId, TrustLevel};

    use crate::crypto::SecretCipher;
    use crate::logbus::MemoryLogStore;
    use crate::store::Store;

    #[tokio::test]
    async fn test_dispatcher_creation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");
        let store = Store::new(pool, SecretCipher::disabled());
        let (hub, hub_events) = WorkerHub::new();
        let logbus = Arc::new(LogBus::new(Arc::new(MemoryLogStore::new())));
        let forge = Forge::new(reqwest::Client::new());
        let status = StatusPoster::start(store.clone(), forge.clone(), 3);

        let (_dispatcher, handle) = Dispatcher::new(
            store,
            hub,
            hub_events,
            logbus,
            forge,
            status,
            DispatchConfig::default(),
            "http://localhost:8080".to_string(),
        );

        // The handle survives the dispatcher not yet running.
        handle.enqueue_job(JobId::new());
    }

    fn terminal_job(status: JobStatus) -> Job {
        Job {
            id: JobId::new(),
            repo_id: RepoId::new(),
            commit_sha: "abc1234".to_string(),
            ref_type: RefType::Branch,
            ref_name: "main".to_string(),
            pr_number: None,
            base_branch: None,
            author: "octocat".to_string(),
            build_command: "make".to_string(),
            services: Default::default(),
            trust: TrustLevel::Owner,
            is_fork: false,
            status,
            assigned_worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: Some(Utc::now()),
            exit_code: Some(2),
            duration_ms: Some(42_000),
            error_phase: Some(ErrorPhase::Timeout),
            attempt: 1,
            parent_job_id: None,
            timeout_secs: 1800,
        }
    }

    #[test]
    fn test_terminal_update_success() {
        let mut job = terminal_job(JobStatus::Success);
        job.exit_code = Some(0);
        job.error_phase = None;
        let update = terminal_update(&job, "https://ci.example.org/");
        assert_eq!(update.state, CommitState::Success);
        assert!(update.description.contains("42s"));
        assert!(update.target_url.starts_with("https://ci.example.org/jobs/"));
        assert!(!update.target_url.contains("//jobs"));
    }

    #[test]
    fn test_terminal_update_failed() {
        let job = terminal_job(JobStatus::Failed);
        let update = terminal_update(&job, "https://ci.example.org");
        assert_eq!(update.state, CommitState::Failure);
        assert!(update.description.contains("exit code 2"));
    }

    #[test]
    fn test_terminal_update_error_names_phase() {
        let job = terminal_job(JobStatus::Error);
        let update = terminal_update(&job, "https://ci.example.org");
        assert_eq!(update.state, CommitState::Error);
        assert!(update.description.contains("timeout"));
    }

    #[test]
    fn test_job_ref_variants() {
        let mut job = terminal_job(JobStatus::Success);
        assert!(matches!(job_ref(&job), JobRef::Branch { .. }));

        job.ref_type = RefType::Tag;
        assert!(matches!(job_ref(&job), JobRef::Tag { .. }));

        job.ref_type = RefType::PullRequest;
        job.pr_number = Some(7);
        job.base_branch = Some("main".to_string());
        match job_ref(&job) {
            JobRef::PullRequest { number, base } => {
                assert_eq!(number, 7);
                assert_eq!(base, "main");
            }
            other => panic!("unexpected ref: {:?}", other),
        }
    }
}
