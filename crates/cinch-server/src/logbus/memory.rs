use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use cinch_core::error::Result;
use cinch_core::model::{JobId, LogChunk};

use super::{BoxFuture, LogStore};

/// In-memory log store used in tests and as the fallback when no durable
/// backend is configured.
#[derive(Default)]
pub struct MemoryLogStore {
    chunks: Mutex<Vec<LogChunk>>,
    finalized: Mutex<HashSet<(JobId, i32)>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt has been finalized.
    pub fn is_finalized(&self, job_id: JobId, attempt: i32) -> bool {
        self.finalized.lock().unwrap().contains(&(job_id, attempt))
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, chunk: LogChunk) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        })
    }

    fn finalize(&self, job_id: JobId, attempt: i32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.finalized.lock().unwrap().insert((job_id, attempt));
            Ok(())
        })
    }

    fn read(&self, job_id: JobId, attempt: Option<i32>) -> BoxFuture<'_, Result<Vec<LogChunk>>> {
        Box::pin(async move {
            let chunks = self.chunks.lock().unwrap();
            Ok(chunks
                .iter()
                .filter(|c| c.job_id == job_id && attempt.map_or(true, |a| c.attempt == a))
                .cloned()
                .collect())
        })
    }

    fn delete_before(&self, _cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::model::LogStream;

    #[tokio::test]
    async fn test_append_read_by_attempt() {
        let store = MemoryLogStore::new();
        let job_id = JobId::new();

        for attempt in [1, 1, 2] {
            store
                .append(LogChunk {
                    job_id,
                    attempt,
                    stream: LogStream::Stdout,
                    ts_ms: 0,
                    data: format!("attempt {}", attempt),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.read(job_id, None).await.unwrap().len(), 3);
        assert_eq!(store.read(job_id, Some(1)).await.unwrap().len(), 2);
        assert_eq!(store.read(job_id, Some(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_marks_attempt() {
        let store = MemoryLogStore::new();
        let job_id = JobId::new();

        assert!(!store.is_finalized(job_id, 1));
        store.finalize(job_id, 1).await.unwrap();
        assert!(store.is_finalized(job_id, 1));
        assert!(!store.is_finalized(job_id, 2));
    }
}
