use std::collections::BTreeMap;

use sqlx::Row;

use cinch_core::error::{CinchError, Result};
use cinch_core::model::{
    ErrorPhase, Job, JobId, JobOutcome, JobStatus, RefType, RepoId, TrustLevel, WorkerId,
};
use cinch_core::repoconfig::ServiceSpec;

use super::Store;

/// Fields needed to materialize a job from a webhook.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub ref_type: RefType,
    pub ref_name: String,
    pub pr_number: Option<i64>,
    pub base_branch: Option<String>,
    pub author: String,
    pub build_command: String,
    pub services: BTreeMap<String, ServiceSpec>,
    pub trust: TrustLevel,
    pub is_fork: bool,
    pub timeout_secs: u64,
}

/// What happened to a running job whose worker disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in PENDING with the next attempt index.
    Requeued { attempt: i32 },
    /// Attempt bound reached; the job is now terminal.
    Escalated,
    /// The job was no longer running on that worker.
    NotRunning,
}

/// What a cancel request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was waiting and is now terminal.
    WasQueued,
    /// The job was running; the assigned worker should receive a CANCEL.
    WasRunning { worker_id: WorkerId },
}

impl Store {
    /// Create a job row in its initial status. Webhook redelivery is
    /// idempotent: the existing auto-triggered row for (repo, commit) is
    /// returned instead of a duplicate.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        // The auto-triggered row keeps its identity when worker-loss
        // re-queue bumps its attempt in place, so the redelivery check
        // must not key on a literal attempt index. It is the one row with
        // no parent; retries always link to theirs.
        if let Some(existing) = self.find_auto_job(new.repo_id, &new.commit_sha).await? {
            return Ok(existing);
        }

        let id = JobId::new();
        let status = Job::initial_status(new.trust);

        let inserted = sqlx::query(
            r#"
            INSERT INTO cinch_jobs
                (id, repo_id, commit_sha, ref_type, ref_name, pr_number, base_branch,
                 author, build_command, services, trust, is_fork, status, attempt,
                 timeout_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14)
            ON CONFLICT (repo_id, commit_sha, attempt) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(new.repo_id.as_uuid())
        .bind(&new.commit_sha)
        .bind(new.ref_type.as_str())
        .bind(&new.ref_name)
        .bind(new.pr_number)
        .bind(&new.base_branch)
        .bind(&new.author)
        .bind(&new.build_command)
        .bind(serde_json::to_value(&new.services)?)
        .bind(new.trust.as_str())
        .bind(new.is_fork)
        .bind(status.as_str())
        .bind(new.timeout_secs as i64)
        .execute(self.pool())
        .await?;

        if inserted.rows_affected() == 1 {
            return self.get_job(id).await;
        }

        // Lost a race with a concurrent delivery of the same commit.
        self.find_auto_job(new.repo_id, &new.commit_sha)
            .await?
            .ok_or_else(|| {
                CinchError::Internal(format!(
                    "duplicate job insert for {} with no existing row",
                    new.commit_sha
                ))
            })
    }

    /// The auto-triggered (parentless) job for a commit, if one exists.
    async fn find_auto_job(&self, repo_id: RepoId, commit_sha: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM cinch_jobs
            WHERE repo_id = $1 AND commit_sha = $2 AND parent_job_id IS NULL
            ORDER BY attempt ASC
            LIMIT 1
            "#,
        )
        .bind(repo_id.as_uuid())
        .bind(commit_sha)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(self.get_job(JobId::from_uuid(row.get("id"))).await?)),
            None => Ok(None),
        }
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query(
            r#"
            SELECT id, repo_id, commit_sha, ref_type, ref_name, pr_number, base_branch,
                   author, build_command, services, trust, is_fork, status,
                   assigned_worker_id, created_at, started_at, finished_at, exit_code,
                   duration_ms, error_phase, attempt, parent_job_id, timeout_secs
            FROM cinch_jobs WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CinchError::NotFound(format!("job {}", id)))?;

        Ok(job_from_row(&row))
    }

    /// Return jobs left RUNNING by a control-plane restart to PENDING
    /// with the next attempt. Runs before any worker reconnects.
    pub async fn recover_interrupted_jobs(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = 'pending', assigned_worker_id = NULL, started_at = NULL,
                attempt = attempt + 1
            WHERE status = 'running'
            RETURNING id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| JobId::from_uuid(r.get("id")))
            .collect())
    }

    /// Ids of all dispatchable jobs, oldest first. Used to rebuild the
    /// ready queue on startup.
    pub async fn list_pending_job_ids(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM cinch_jobs WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| JobId::from_uuid(r.get("id")))
            .collect())
    }

    /// Release a held contributor job for dispatch.
    pub async fn approve_job(&self, id: JobId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cinch_jobs SET status = 'pending'
            WHERE id = $1 AND status = 'pending_contributor'
            "#,
        )
        .bind(id.as_uuid())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a bad id from a bad state for the caller.
            let _ = self.get_job(id).await?;
            return Err(CinchError::Conflict(format!(
                "job {} is not awaiting approval",
                id
            )));
        }
        Ok(())
    }

    /// Atomically transition PENDING -> RUNNING with the worker recorded,
    /// and open the log index for the attempt. Returns the attempt index.
    pub async fn mark_job_running(&self, id: JobId, worker: WorkerId) -> Result<i32> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = 'running', assigned_worker_id = $2, started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING attempt
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CinchError::Conflict(format!("job {} is not pending", id)))?;

        let attempt: i32 = row.get("attempt");

        sqlx::query(
            r#"
            INSERT INTO cinch_log_index (job_id, attempt)
            VALUES ($1, $2)
            ON CONFLICT (job_id, attempt) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(attempt)
    }

    /// Record a terminal outcome reported by the assigned worker. The
    /// worker guard makes forged or late completions a no-op at the
    /// durable layer as well.
    pub async fn complete_job(
        &self,
        id: JobId,
        worker: WorkerId,
        outcome: &JobOutcome,
    ) -> Result<()> {
        let (status, exit_code, duration_ms, phase) = match outcome {
            JobOutcome::Success { duration_ms } => {
                (JobStatus::Success, Some(0), Some(*duration_ms), None)
            }
            JobOutcome::Failed {
                exit_code,
                duration_ms,
            } => (JobStatus::Failed, Some(*exit_code), Some(*duration_ms), None),
            JobOutcome::Error { phase } => (JobStatus::Error, None, None, Some(*phase)),
        };

        let result = sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = $3, assigned_worker_id = NULL, finished_at = NOW(),
                exit_code = $4, duration_ms = $5, error_phase = $6
            WHERE id = $1 AND status = 'running' AND assigned_worker_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_uuid())
        .bind(status.as_str())
        .bind(exit_code)
        .bind(duration_ms)
        .bind(phase.map(|p| p.as_str()))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CinchError::Conflict(format!(
                "job {} is not running on worker {}",
                id, worker
            )));
        }
        Ok(())
    }

    /// Handle worker loss for one running job: return it to PENDING with
    /// the next attempt index, or escalate to ERROR once the bound is hit.
    pub async fn requeue_lost_job(
        &self,
        id: JobId,
        worker: WorkerId,
        max_attempts: u32,
    ) -> Result<RequeueOutcome> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT attempt FROM cinch_jobs
            WHERE id = $1 AND status = 'running' AND assigned_worker_id = $2
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(RequeueOutcome::NotRunning);
        };
        let attempt: i32 = row.get("attempt");

        if attempt as u32 >= max_attempts {
            sqlx::query(
                r#"
                UPDATE cinch_jobs
                SET status = 'error', assigned_worker_id = NULL, finished_at = NOW(),
                    error_phase = 'run',
                    error_message = 'worker connection lost; attempt bound reached'
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(RequeueOutcome::Escalated);
        }

        sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = 'pending', assigned_worker_id = NULL, started_at = NULL,
                attempt = attempt + 1
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RequeueOutcome::Requeued {
            attempt: attempt + 1,
        })
    }

    /// Force a running job terminal after its timeout fired and the cancel
    /// grace elapsed. Guarded on the attempt so a re-queued successor is
    /// never clobbered by a stale timer. Returns the worker that held the
    /// assignment, or None when the job already left RUNNING.
    pub async fn timeout_job(&self, id: JobId, attempt: i32) -> Result<Option<WorkerId>> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT assigned_worker_id FROM cinch_jobs
            WHERE id = $1 AND status = 'running' AND attempt = $2
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempt)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let worker: Option<uuid::Uuid> = row.get("assigned_worker_id");

        sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = 'error', assigned_worker_id = NULL, finished_at = NOW(),
                error_phase = 'timeout'
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(worker.map(WorkerId::from_uuid))
    }

    /// Cancel a queued or running job.
    pub async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT status, assigned_worker_id FROM cinch_jobs
            WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CinchError::NotFound(format!("job {}", id)))?;

        let status = JobStatus::parse(row.get::<String, _>("status").as_str())
            .ok_or_else(|| CinchError::Internal("unknown job status".to_string()))?;

        if status.is_terminal() {
            return Err(CinchError::Conflict(format!("job {} already finished", id)));
        }

        sqlx::query(
            r#"
            UPDATE cinch_jobs
            SET status = 'error', assigned_worker_id = NULL, finished_at = NOW(),
                error_phase = 'cancelled'
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        match status {
            JobStatus::Running => {
                let worker: Option<uuid::Uuid> = row.get("assigned_worker_id");
                Ok(CancelOutcome::WasRunning {
                    worker_id: WorkerId::from_uuid(worker.ok_or_else(|| {
                        CinchError::Internal("running job without worker".to_string())
                    })?),
                })
            }
            _ => Ok(CancelOutcome::WasQueued),
        }
    }

    /// Create a fresh attempt of a terminal job, linked to its parent.
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let parent = self.get_job(id).await?;
        if !parent.status.is_terminal() {
            return Err(CinchError::Conflict(format!(
                "job {} has not finished; cancel it instead",
                id
            )));
        }

        let next_attempt: i32 = sqlx::query(
            r#"
            SELECT COALESCE(MAX(attempt), 0) + 1 AS next
            FROM cinch_jobs WHERE repo_id = $1 AND commit_sha = $2
            "#,
        )
        .bind(parent.repo_id.as_uuid())
        .bind(&parent.commit_sha)
        .fetch_one(self.pool())
        .await?
        .get("next");

        let new_id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO cinch_jobs
                (id, repo_id, commit_sha, ref_type, ref_name, pr_number, base_branch,
                 author, build_command, services, trust, is_fork, status, attempt,
                 parent_job_id, timeout_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending',
                    $13, $14, $15)
            "#,
        )
        .bind(new_id.as_uuid())
        .bind(parent.repo_id.as_uuid())
        .bind(&parent.commit_sha)
        .bind(parent.ref_type.as_str())
        .bind(&parent.ref_name)
        .bind(parent.pr_number)
        .bind(&parent.base_branch)
        .bind(&parent.author)
        .bind(&parent.build_command)
        .bind(serde_json::to_value(&parent.services)?)
        .bind(parent.trust.as_str())
        .bind(parent.is_fork)
        .bind(next_attempt)
        .bind(id.as_uuid())
        .bind(parent.timeout_secs as i64)
        .execute(self.pool())
        .await?;

        self.get_job(new_id).await
    }

    /// Record that the terminal status never reached the forge. The job's
    /// terminal state is untouched.
    pub async fn note_status_post_failure(&self, id: JobId, message: &str) -> Result<()> {
        sqlx::query("UPDATE cinch_jobs SET status_post_error = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(message)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Job {
    Job {
        id: JobId::from_uuid(row.get("id")),
        repo_id: RepoId::from_uuid(row.get("repo_id")),
        commit_sha: row.get("commit_sha"),
        ref_type: RefType::parse(row.get::<String, _>("ref_type").as_str())
            .unwrap_or(RefType::Branch),
        ref_name: row.get("ref_name"),
        pr_number: row.get("pr_number"),
        base_branch: row.get("base_branch"),
        author: row.get("author"),
        build_command: row.get("build_command"),
        services: serde_json::from_value(row.get::<serde_json::Value, _>("services"))
            .unwrap_or_default(),
        trust: TrustLevel::parse(row.get::<String, _>("trust").as_str())
            .unwrap_or(TrustLevel::External),
        is_fork: row.get("is_fork"),
        status: JobStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(JobStatus::Error),
        assigned_worker_id: row
            .get::<Option<uuid::Uuid>, _>("assigned_worker_id")
            .map(WorkerId::from_uuid),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        exit_code: row.get("exit_code"),
        duration_ms: row.get("duration_ms"),
        error_phase: row
            .get::<Option<String>, _>("error_phase")
            .and_then(|p| ErrorPhase::parse(&p)),
        attempt: row.get("attempt"),
        parent_job_id: row
            .get::<Option<uuid::Uuid>, _>("parent_job_id")
            .map(JobId::from_uuid),
        timeout_secs: row.get::<i64, _>("timeout_secs") as u64,
    }
}
