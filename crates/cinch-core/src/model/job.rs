use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repoconfig::ServiceSpec;

use super::repo::RepoId;
use super::worker::WorkerId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random job ID.
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

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of ref triggered the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Branch,
    Tag,
    PullRequest,
}

impl RefType {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Tag => "tag",
            Self::PullRequest => "pull_request",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "branch" => Some(Self::Branch),
            "tag" => Some(Self::Tag),
            "pull_request" => Some(Self::PullRequest),
            _ => None,
        }
    }
}

/// Trust classification gating which workers a job may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Owner,
    Collaborator,
    External,
}

impl TrustLevel {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Collaborator => "collaborator",
            Self::External => "external",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "collaborator" => Some(Self::Collaborator),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    /// External jobs must be explicitly approved before dispatch.
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::External)
    }
}

/// Phase in which a job failed outside its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Clone,
    Service,
    Run,
    Timeout,
    Cancelled,
}

impl ErrorPhase {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Service => "service",
            Self::Run => "run",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clone" => Some(Self::Clone),
            "service" => Some(Self::Service),
            "run" => Some(Self::Run),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// External-trust job awaiting owner approval.
    PendingContributor,
    /// Ready for dispatch.
    Pending,
    /// Assigned to a worker and executing.
    Running,
    /// Completed with exit code 0.
    Success,
    /// Completed with non-zero exit code.
    Failed,
    /// Did not complete: infrastructure error, timeout, or cancellation.
    Error,
}

impl JobStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingContributor => "pending_contributor",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_contributor" => Some(Self::PendingContributor),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Error)
    }

    /// Whether the transition `self -> next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            // Owner approval releases a held contributor job.
            (PendingContributor, Pending) => true,
            // Cancelling a held job is also allowed.
            (PendingContributor, Error) => true,
            (Pending, Running) => true,
            (Pending, Error) => true,
            (Running, Success) => true,
            (Running, Failed) => true,
            (Running, Error) => true,
            // Worker loss sends a running job back for another attempt.
            (Running, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Build command exited 0.
    Success { duration_ms: i64 },
    /// Build command exited non-zero.
    Failed { exit_code: i32, duration_ms: i64 },
    /// The job never produced an exit code.
    Error { phase: ErrorPhase },
}

impl JobOutcome {
    /// The job status this outcome transitions to.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Success { .. } => JobStatus::Success,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Error { .. } => JobStatus::Error,
        }
    }

    /// Build an outcome from a worker-reported exit code.
    pub fn from_exit(exit_code: i32, duration_ms: i64) -> Self {
        if exit_code == 0 {
            Self::Success { duration_ms }
        } else {
            Self::Failed {
                exit_code,
                duration_ms,
            }
        }
    }
}

/// A build job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job ID.
    pub id: JobId,
    /// Repository the job builds.
    pub repo_id: RepoId,
    /// Commit SHA being built.
    pub commit_sha: String,
    /// What kind of ref triggered the job.
    pub ref_type: RefType,
    /// Branch or tag name; for pull requests, the head ref.
    pub ref_name: String,
    /// Pull request number, when applicable.
    pub pr_number: Option<i64>,
    /// Base branch for pull requests.
    pub base_branch: Option<String>,
    /// Forge login of whoever triggered the event.
    pub author: String,
    /// Command resolved from the in-repo config at the event's commit.
    pub build_command: String,
    /// Sidecar services resolved from the same config.
    pub services: BTreeMap<String, ServiceSpec>,
    /// Trust classification.
    pub trust: TrustLevel,
    /// Whether the head lives in a fork.
    pub is_fork: bool,
    /// Current status.
    pub status: JobStatus,
    /// Assigned worker; non-null iff status is Running.
    pub assigned_worker_id: Option<WorkerId>,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
    /// When the job entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, for Success/Failed.
    pub exit_code: Option<i32>,
    /// Wall-clock duration reported by the worker.
    pub duration_ms: Option<i64>,
    /// Failure phase, for Error.
    pub error_phase: Option<ErrorPhase>,
    /// 1-based execution attempt.
    pub attempt: i32,
    /// Previous attempt or retried job, if any.
    pub parent_job_id: Option<JobId>,
    /// Effective timeout for this job in seconds.
    pub timeout_secs: u64,
}

impl Job {
    /// Initial status for a freshly ingested job: external trust is held
    /// for approval, everything else is immediately dispatchable.
    pub fn initial_status(trust: TrustLevel) -> JobStatus {
        if trust.requires_approval() {
            JobStatus::PendingContributor
        } else {
            JobStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::PendingContributor,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        use JobStatus::*;
        assert!(PendingContributor.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Error));
        assert!(Running.can_transition_to(Pending)); // worker loss re-queue
    }

    #[test]
    fn test_illegal_transitions() {
        use JobStatus::*;
        assert!(!Success.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
        assert!(!PendingContributor.can_transition_to(Running));
        assert!(!Error.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_initial_status_by_trust() {
        assert_eq!(
            Job::initial_status(TrustLevel::External),
            JobStatus::PendingContributor
        );
        assert_eq!(Job::initial_status(TrustLevel::Owner), JobStatus::Pending);
        assert_eq!(
            Job::initial_status(TrustLevel::Collaborator),
            JobStatus::Pending
        );
    }

    #[test]
    fn test_outcome_from_exit() {
        assert_eq!(
            JobOutcome::from_exit(0, 1200).status(),
            JobStatus::Success
        );
        assert_eq!(
            JobOutcome::from_exit(2, 1200).status(),
            JobStatus::Failed
        );
    }
}
