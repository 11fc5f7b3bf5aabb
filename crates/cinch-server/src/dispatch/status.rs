//! Asynchronous forge status posting with bounded retry.
//!
//! Terminal job state is recorded before anything is posted; a forge that
//! is down can delay the badge but never flip the stored outcome.

use std::time::Duration;

use tokio::sync::mpsc;

use cinch_core::event::StatusUpdate;
use cinch_core::model::{JobId, RepoId};

use crate::forge::Forge;
use crate::store::Store;

/// One status to deliver.
#[derive(Debug)]
pub struct StatusTask {
    pub job_id: JobId,
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub update: StatusUpdate,
}

/// Handle for enqueueing status posts; delivery runs on its own task.
#[derive(Clone)]
pub struct StatusPoster {
    tx: mpsc::UnboundedSender<StatusTask>,
}

impl StatusPoster {
    /// Spawn the delivery task.
    pub fn start(store: Store, forge: Forge, max_retries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, store, forge, max_retries));
        Self { tx }
    }

    /// Queue a status post. Delivery is best-effort and asynchronous.
    pub fn enqueue(&self, task: StatusTask) {
        if self.tx.send(task).is_err() {
            tracing::warn!("Status poster is gone; dropping status update");
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<StatusTask>,
    store: Store,
    forge: Forge,
    max_retries: u32,
) {
    while let Some(task) = rx.recv().await {
        deliver(&store, &forge, task, max_retries).await;
    }
}

async fn deliver(store: &Store, forge: &Forge, task: StatusTask, max_retries: u32) {
    let repo = match store.get_repo(task.repo_id).await {
        Ok(repo) => repo,
        Err(e) => {
            tracing::warn!(job_id = %task.job_id, "Cannot load repo for status post: {}", e);
            return;
        }
    };

    let mut attempt = 0u32;
    loop {
        match forge.post_status(&repo, &task.commit_sha, &task.update).await {
            Ok(()) => {
                tracing::debug!(
                    job_id = %task.job_id,
                    state = task.update.state.as_str(),
                    "Status posted"
                );
                return;
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(attempt);
                tracing::debug!(
                    job_id = %task.job_id,
                    attempt,
                    "Transient status post failure, retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %task.job_id,
                    state = task.update.state.as_str(),
                    "Status post failed permanently: {}",
                    e
                );
                let _ = store
                    .note_status_post_failure(task.job_id, &e.to_string())
                    .await;
                return;
            }
        }
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }
}
