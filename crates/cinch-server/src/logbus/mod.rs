//! Per-job publish/subscribe fan-out of log chunks.
//!
//! Workers publish chunks; any number of viewers subscribe. Durable writes
//! go through the [`LogStore`] seam and are never gated by subscribers: a
//! viewer that cannot keep up is dropped, the producer is never
//! backpressured.

mod memory;

pub use memory::MemoryLogStore;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};

use cinch_core::error::Result;
use cinch_core::model::{JobId, JobStatus, LogChunk};
use cinch_core::protocol::ViewerMessage;

/// Boxed future alias for the store seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable log persistence. The bus appends while a job runs, finalizes
/// the attempt on terminal, and retention deletes old attempts.
pub trait LogStore: Send + Sync {
    /// Append one chunk.
    fn append(&self, chunk: LogChunk) -> BoxFuture<'_, Result<()>>;

    /// Freeze an attempt's log after the job reaches a terminal status.
    fn finalize(&self, job_id: JobId, attempt: i32) -> BoxFuture<'_, Result<()>>;

    /// Read chunks in publish order, optionally restricted to one attempt.
    fn read(&self, job_id: JobId, attempt: Option<i32>) -> BoxFuture<'_, Result<Vec<LogChunk>>>;

    /// Delete attempts finalized before the cutoff. Returns chunks removed.
    fn delete_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;
}

/// How many viewer messages buffer per subscriber before it is dropped.
const VIEWER_BUFFER: usize = 256;

/// How long a closed topic's terminal status stays answerable for late
/// subscribers.
const CLOSED_RETENTION: Duration = Duration::from_secs(30);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ViewerMessage>,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Handle identifying one subscription; pass back to unsubscribe.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberHandle {
    job_id: JobId,
    id: u64,
}

/// What a new subscriber gets: replayed history, the live channel, and the
/// terminal status if the job already finished.
pub struct Subscription {
    pub handle: SubscriberHandle,
    pub receiver: mpsc::Receiver<ViewerMessage>,
    pub history: Vec<LogChunk>,
    pub terminal: Option<JobStatus>,
}

/// The per-job log fan-out.
pub struct LogBus {
    topics: RwLock<HashMap<JobId, Arc<Mutex<Topic>>>>,
    recently_closed: Mutex<HashMap<JobId, (JobStatus, Instant)>>,
    store: Arc<dyn LogStore>,
}

impl LogBus {
    /// Create a bus over a log store.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            recently_closed: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Append a chunk durably and fan it out to the job's subscribers.
    /// Slow or gone subscribers are dropped.
    pub async fn publish(&self, chunk: LogChunk) -> Result<()> {
        let chunk = chunk.bounded();
        self.store.append(chunk.clone()).await?;

        let topic = {
            let topics = self.topics.read().await;
            topics.get(&chunk.job_id).cloned()
        };
        let Some(topic) = topic else {
            return Ok(());
        };

        let message = ViewerMessage::Chunk {
            stream: chunk.stream,
            ts_ms: chunk.ts_ms,
            data: chunk.data,
        };

        let mut topic = topic.lock().await;
        topic.subscribers.retain(|sub| {
            match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(job_id = %chunk.job_id, sub = sub.id, "Dropping slow log viewer");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Ok(())
    }

    /// Subscribe to a job's log. Replays stored history for a seamless
    /// join; if the job already closed, the terminal status comes back
    /// immediately and the live channel stays empty.
    pub async fn subscribe(&self, job_id: JobId, attempt: Option<i32>) -> Result<Subscription> {
        let history = self.store.read(job_id, attempt).await?;

        if let Some(status) = self.closed_status(job_id).await {
            let (_, receiver) = mpsc::channel(1);
            return Ok(Subscription {
                handle: SubscriberHandle { job_id, id: 0 },
                receiver,
                history,
                terminal: Some(status),
            });
        }

        let topic = {
            let mut topics = self.topics.write().await;
            topics.entry(job_id).or_default().clone()
        };

        let (tx, receiver) = mpsc::channel(VIEWER_BUFFER);
        let mut topic = topic.lock().await;
        let id = topic.next_id;
        topic.next_id += 1;
        topic.subscribers.push(Subscriber { id, tx });

        Ok(Subscription {
            handle: SubscriberHandle { job_id, id },
            receiver,
            history,
            terminal: None,
        })
    }

    /// Remove one subscriber.
    pub async fn unsubscribe(&self, handle: SubscriberHandle) {
        let topic = {
            let topics = self.topics.read().await;
            topics.get(&handle.job_id).cloned()
        };
        if let Some(topic) = topic {
            let mut topic = topic.lock().await;
            topic.subscribers.retain(|s| s.id != handle.id);
        }
    }

    /// Broadcast the terminal marker, finalize the attempt in the store,
    /// and release the topic. Late subscribers within the retention window
    /// still learn the terminal status.
    pub async fn close_job(&self, job_id: JobId, attempt: i32, status: JobStatus) -> Result<()> {
        self.store.finalize(job_id, attempt).await?;

        let topic = {
            let mut topics = self.topics.write().await;
            topics.remove(&job_id)
        };

        if let Some(topic) = topic {
            let topic = topic.lock().await;
            for sub in &topic.subscribers {
                let _ = sub.tx.try_send(ViewerMessage::Terminal { status });
            }
        }

        let mut closed = self.recently_closed.lock().await;
        let now = Instant::now();
        closed.retain(|_, (_, at)| now.duration_since(*at) < CLOSED_RETENTION);
        closed.insert(job_id, (status, now));

        Ok(())
    }

    /// How many subscribers a job currently has.
    pub async fn subscriber_count(&self, job_id: JobId) -> usize {
        let topic = {
            let topics = self.topics.read().await;
            topics.get(&job_id).cloned()
        };
        match topic {
            Some(topic) => topic.lock().await.subscribers.len(),
            None => 0,
        }
    }

    async fn closed_status(&self, job_id: JobId) -> Option<JobStatus> {
        let closed = self.recently_closed.lock().await;
        closed
            .get(&job_id)
            .filter(|(_, at)| at.elapsed() < CLOSED_RETENTION)
            .map(|(status, _)| *status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::model::LogStream;

    fn chunk(job_id: JobId, ts_ms: i64, data: &str) -> LogChunk {
        LogChunk {
            job_id,
            attempt: 1,
            stream: LogStream::Stdout,
            ts_ms,
            data: data.to_string(),
        }
    }

    fn bus() -> LogBus {
        LogBus::new(Arc::new(MemoryLogStore::new()))
    }

    #[tokio::test]
    async fn test_subscriber_receives_chunks_in_order() {
        let bus = bus();
        let job_id = JobId::new();

        let mut sub = bus.subscribe(job_id, None).await.unwrap();
        assert!(sub.history.is_empty());

        for i in 0..5 {
            bus.publish(chunk(job_id, i, &format!("line {}", i))).await.unwrap();
        }

        for i in 0..5 {
            match sub.receiver.recv().await.unwrap() {
                ViewerMessage::Chunk { ts_ms, data, .. } => {
                    assert_eq!(ts_ms, i);
                    assert_eq!(data, format!("line {}", i));
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_replay_on_subscribe() {
        let bus = bus();
        let job_id = JobId::new();

        bus.publish(chunk(job_id, 1, "early")).await.unwrap();
        bus.publish(chunk(job_id, 2, "lines")).await.unwrap();

        let sub = bus.subscribe(job_id, None).await.unwrap();
        assert_eq!(sub.history.len(), 2);
        assert_eq!(sub.history[0].data, "early");
        assert_eq!(sub.history[1].data, "lines");
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_blocking() {
        let bus = bus();
        let job_id = JobId::new();

        let sub = bus.subscribe(job_id, None).await.unwrap();
        assert_eq!(bus.subscriber_count(job_id).await, 1);

        // Never drain the receiver; overflow the buffer.
        for i in 0..(VIEWER_BUFFER as i64 + 10) {
            bus.publish(chunk(job_id, i, "spam")).await.unwrap();
        }

        assert_eq!(bus.subscriber_count(job_id).await, 0);
        drop(sub);
    }

    #[tokio::test]
    async fn test_close_broadcasts_terminal() {
        let bus = bus();
        let job_id = JobId::new();

        let mut sub = bus.subscribe(job_id, None).await.unwrap();
        bus.close_job(job_id, 1, JobStatus::Success).await.unwrap();

        match sub.receiver.recv().await.unwrap() {
            ViewerMessage::Terminal { status } => assert_eq!(status, JobStatus::Success),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_terminal() {
        let bus = bus();
        let job_id = JobId::new();

        bus.publish(chunk(job_id, 1, "output")).await.unwrap();
        bus.close_job(job_id, 1, JobStatus::Failed).await.unwrap();

        let sub = bus.subscribe(job_id, None).await.unwrap();
        assert_eq!(sub.terminal, Some(JobStatus::Failed));
        assert_eq!(sub.history.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_viewer() {
        let bus = bus();
        let job_id = JobId::new();

        let sub = bus.subscribe(job_id, None).await.unwrap();
        assert_eq!(bus.subscriber_count(job_id).await, 1);

        bus.unsubscribe(sub.handle).await;
        assert_eq!(bus.subscriber_count(job_id).await, 0);
    }

    #[tokio::test]
    async fn test_publish_persists_even_without_subscribers() {
        let bus = bus();
        let job_id = JobId::new();

        bus.publish(chunk(job_id, 1, "kept")).await.unwrap();

        let stored = bus.store().read(job_id, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data, "kept");
    }
}
