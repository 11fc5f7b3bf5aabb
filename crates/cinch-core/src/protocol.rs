//! Wire protocol for worker, viewer, and relay streams.
//!
//! All frames are JSON with a `type` tag. Messages within one stream are
//! delivered in publication order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{ErrorPhase, JobId, JobStatus, LogStream, WorkerId, WorkerMode};
use crate::repoconfig::ServiceSpec;

/// Messages a worker sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Bearer credential, first frame after connect. Never in the URL.
    Auth { token: String },
    /// Advertise capabilities after a successful auth.
    Register {
        name: String,
        hostname: String,
        labels: Vec<String>,
        mode: WorkerMode,
        concurrency: u32,
        version: String,
    },
    /// A chunk of build output. The attempt echoes the assignment
    /// envelope so chunks land under the attempt that produced them.
    Log {
        job_id: JobId,
        attempt: i32,
        stream: LogStream,
        ts_ms: i64,
        data: String,
    },
    /// The build command finished.
    Complete {
        job_id: JobId,
        exit_code: i32,
        duration_ms: i64,
    },
    /// The job failed before producing an exit code.
    Error {
        job_id: JobId,
        phase: ErrorPhase,
        message: String,
    },
    /// Heartbeat carrying the worker's view of its active jobs.
    Ping { active_jobs: Vec<JobId> },
    /// Reply to a server ping.
    Pong,
}

/// Messages the server sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted; the worker id is stable per credential.
    AuthOk { worker_id: WorkerId },
    /// Authentication rejected; the server closes the stream after this.
    AuthFail { reason: String },
    /// A job assignment.
    Assign(Box<JobEnvelope>),
    /// Stop the named job.
    Cancel { job_id: JobId },
    /// Stop accepting work, finish in-flight jobs.
    Drain,
    /// Heartbeat reply.
    Pong,
}

/// Everything a worker needs to execute one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    /// 1-based execution attempt.
    pub attempt: i32,
    pub repo: RepoEnvelope,
    /// Command executed inside the build container.
    pub build_command: String,
    /// Timeout in seconds; the server also enforces this.
    pub timeout_secs: u64,
    /// Extra environment for the build.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Sidecar services the worker starts before the build.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    /// Decrypted repo secrets exposed to the build environment.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Repository coordinates inside an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEnvelope {
    pub clone_url: String,
    pub commit_sha: String,
    #[serde(rename = "ref")]
    pub reference: JobRef,
    /// Short-lived clone credential; empty for public repos.
    pub clone_token: String,
}

/// The ref a job checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRef {
    Branch { name: String },
    Tag { name: String },
    PullRequest { number: i64, base: String },
}

/// Messages the server sends to a log viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// A log chunk, live or replayed.
    Chunk {
        stream: LogStream,
        ts_ms: i64,
        data: String,
    },
    /// The job reached a terminal status; no more chunks follow.
    Terminal { status: JobStatus },
}

/// Frames exchanged with a public relay by NAT'd self-hosted deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// First client frame: authenticate the deployment.
    Auth { token: String },
    /// Relay accepted the link.
    AuthOk,
    /// Relay forwards an inbound HTTP request envelope.
    Request {
        id: u64,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        /// Base64-encoded body.
        body: String,
    },
    /// Deployment answers with the local response envelope.
    Response {
        id: u64,
        status: u16,
        headers: Vec<(String, String)>,
        /// Base64-encoded body.
        body: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_frame_parses() {
        let json = r#"{"type":"auth","token":"cinch_abcdef"}"#;
        let msg: WorkerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, WorkerMessage::Auth { .. }));
    }

    #[test]
    fn test_register_frame_parses() {
        let json = r#"{
            "type":"register",
            "name":"garage",
            "hostname":"garage.local",
            "labels":["linux","gpu"],
            "mode":"personal",
            "concurrency":2,
            "version":"0.1.0"
        }"#;
        let msg: WorkerMessage = serde_json::from_str(json).unwrap();
        match msg {
            WorkerMessage::Register {
                labels, concurrency, ..
            } => {
                assert_eq!(labels, vec!["linux", "gpu"]);
                assert_eq!(concurrency, 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_complete_frame_parses() {
        let id = JobId::new();
        let json = format!(
            r#"{{"type":"complete","job_id":"{}","exit_code":0,"duration_ms":4200}}"#,
            id.as_uuid()
        );
        let msg: WorkerMessage = serde_json::from_str(&json).unwrap();
        match msg {
            WorkerMessage::Complete {
                job_id, exit_code, ..
            } => {
                assert_eq!(job_id, id);
                assert_eq!(exit_code, 0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_assign_serializes_with_ref_tag() {
        let envelope = JobEnvelope {
            job_id: JobId::new(),
            attempt: 1,
            repo: RepoEnvelope {
                clone_url: "https://github.com/octocat/hello.git".to_string(),
                commit_sha: "abc1234".to_string(),
                reference: JobRef::PullRequest {
                    number: 7,
                    base: "main".to_string(),
                },
                clone_token: String::new(),
            },
            build_command: "cargo test".to_string(),
            timeout_secs: 1800,
            env: HashMap::new(),
            services: BTreeMap::new(),
            secrets: HashMap::new(),
        };
        let json = serde_json::to_string(&ServerMessage::Assign(Box::new(envelope))).unwrap();
        assert!(json.contains(r#""type":"assign""#));
        assert!(json.contains(r#""kind":"pull_request""#));
    }

    #[test]
    fn test_unknown_frame_rejected() {
        let json = r#"{"type":"reboot"}"#;
        assert!(serde_json::from_str::<WorkerMessage>(json).is_err());
    }
}
