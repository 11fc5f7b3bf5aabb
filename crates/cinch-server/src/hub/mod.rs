//! Registry of live worker connections.
//!
//! One entry per worker id; registering a second connection for the same
//! id supersedes the first (its send channel closes and its socket task is
//! cancelled). Reads hand out copies; per-connection state is mutated only
//! here, behind a read-write lock with short critical sections.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cinch_core::model::{JobId, UserId, WorkerId, WorkerMode, WorkerRegistration, WorkerStatus};
use cinch_core::protocol::ServerMessage;

/// Identifies one physical connection; a superseded connection's id stops
/// matching so its late unregister is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(Uuid);

impl ConnId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Events the hub emits for the dispatcher.
#[derive(Debug)]
pub enum HubEvent {
    /// A worker connected (or re-registered); capacity may have appeared.
    WorkerRegistered { worker_id: WorkerId },
    /// A worker's connection is gone; its in-flight jobs need re-queueing.
    WorkerGone {
        worker_id: WorkerId,
        in_flight: Vec<JobId>,
    },
}

struct WorkerConn {
    conn_id: ConnId,
    owner_user_id: UserId,
    registration: WorkerRegistration,
    sender: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    in_flight: HashSet<JobId>,
    status: WorkerStatus,
    unhealthy: bool,
    last_assigned_at: Option<DateTime<Utc>>,
    connected_at: DateTime<Utc>,
}

/// Copy of a connection's public fields, safe to hold without the lock.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub owner_user_id: UserId,
    pub name: String,
    pub hostname: String,
    pub labels: BTreeSet<String>,
    pub mode: WorkerMode,
    pub concurrency: u32,
    pub version: String,
    pub status: WorkerStatus,
    pub in_flight: usize,
    pub unhealthy: bool,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    /// Remaining assignment capacity.
    pub fn free_slots(&self) -> u32 {
        self.concurrency.saturating_sub(self.in_flight as u32)
    }
}

/// The live worker registry.
pub struct WorkerHub {
    conns: RwLock<HashMap<WorkerId, WorkerConn>>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl WorkerHub {
    /// Create the hub and the event stream the dispatcher consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                conns: RwLock::new(HashMap::new()),
                events,
            }),
            rx,
        )
    }

    /// Insert a connection for an authenticated worker. An existing
    /// connection for the same id is superseded: its socket task is
    /// cancelled, its send channel closes, and its in-flight set carries
    /// over to the new connection.
    pub async fn register(
        &self,
        worker_id: WorkerId,
        owner_user_id: UserId,
        registration: WorkerRegistration,
        sender: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> ConnId {
        let conn_id = ConnId::new();
        let mut carried_in_flight = HashSet::new();

        {
            let mut conns = self.conns.write().await;
            if let Some(old) = conns.remove(&worker_id) {
                tracing::info!(%worker_id, "Superseding existing worker connection");
                old.cancel.cancel();
                carried_in_flight = old.in_flight;
            }

            conns.insert(
                worker_id,
                WorkerConn {
                    conn_id,
                    owner_user_id,
                    registration,
                    sender,
                    cancel,
                    in_flight: carried_in_flight,
                    status: WorkerStatus::Online,
                    unhealthy: false,
                    last_assigned_at: None,
                    connected_at: Utc::now(),
                },
            );
        }

        let _ = self.events.send(HubEvent::WorkerRegistered { worker_id });
        conn_id
    }

    /// Remove a connection. A superseded connection's late unregister does
    /// nothing; a live removal emits the gone event so the dispatcher can
    /// re-queue the in-flight jobs.
    pub async fn unregister(&self, worker_id: WorkerId, conn_id: ConnId) {
        let removed = {
            let mut conns = self.conns.write().await;
            match conns.get(&worker_id) {
                Some(conn) if conn.conn_id == conn_id => conns.remove(&worker_id),
                _ => None,
            }
        };

        if let Some(conn) = removed {
            conn.cancel.cancel();
            let in_flight: Vec<JobId> = conn.in_flight.into_iter().collect();
            tracing::info!(%worker_id, jobs = in_flight.len(), "Worker connection gone");
            let _ = self.events.send(HubEvent::WorkerGone {
                worker_id,
                in_flight,
            });
        }
    }

    /// Non-blocking enqueue to a worker's outbound buffer. A full buffer
    /// drops the message and marks the worker unhealthy so the scheduler
    /// stops picking it.
    pub async fn send(&self, worker_id: WorkerId, message: ServerMessage) -> bool {
        let mut conns = self.conns.write().await;
        let Some(conn) = conns.get_mut(&worker_id) else {
            return false;
        };

        match conn.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%worker_id, "Worker send buffer full; marking unhealthy");
                conn.unhealthy = true;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Copies of every connection's public fields.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let conns = self.conns.read().await;
        conns
            .iter()
            .map(|(worker_id, conn)| WorkerSnapshot {
                worker_id: *worker_id,
                owner_user_id: conn.owner_user_id,
                name: conn.registration.name.clone(),
                hostname: conn.registration.hostname.clone(),
                labels: conn.registration.labels.clone(),
                mode: conn.registration.mode,
                concurrency: conn.registration.concurrency,
                version: conn.registration.version.clone(),
                status: conn.status,
                in_flight: conn.in_flight.len(),
                unhealthy: conn.unhealthy,
                last_assigned_at: conn.last_assigned_at,
                connected_at: conn.connected_at,
            })
            .collect()
    }

    /// Record an assignment. False when the worker is gone.
    pub async fn assign(&self, worker_id: WorkerId, job_id: JobId) -> bool {
        let mut conns = self.conns.write().await;
        match conns.get_mut(&worker_id) {
            Some(conn) => {
                conn.in_flight.insert(job_id);
                conn.last_assigned_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Remove an assignment. A draining worker whose in-flight set empties
    /// is disconnected.
    pub async fn unassign(&self, worker_id: WorkerId, job_id: JobId) {
        let mut conns = self.conns.write().await;
        if let Some(conn) = conns.get_mut(&worker_id) {
            conn.in_flight.remove(&job_id);
            if conn.status == WorkerStatus::Draining && conn.in_flight.is_empty() {
                conn.cancel.cancel();
            }
        }
    }

    /// Whether the worker currently holds the assignment. Authenticates
    /// worker-claimed completion messages.
    pub async fn is_assigned(&self, worker_id: WorkerId, job_id: JobId) -> bool {
        let conns = self.conns.read().await;
        conns
            .get(&worker_id)
            .map(|conn| conn.in_flight.contains(&job_id))
            .unwrap_or(false)
    }

    /// Stop routing new work to a worker; in-flight jobs finish, then the
    /// stream closes. False when the worker is gone.
    pub async fn drain(&self, worker_id: WorkerId) -> bool {
        let should_send = {
            let mut conns = self.conns.write().await;
            match conns.get_mut(&worker_id) {
                Some(conn) => {
                    conn.status = WorkerStatus::Draining;
                    if conn.in_flight.is_empty() {
                        conn.cancel.cancel();
                    }
                    true
                }
                None => false,
            }
        };

        if should_send {
            self.send(worker_id, ServerMessage::Drain).await;
        }
        should_send
    }

    /// Close the stream immediately; in-flight jobs are treated as lost
    /// when the socket task unregisters.
    pub async fn force_disconnect(&self, worker_id: WorkerId) -> bool {
        let conns = self.conns.read().await;
        match conns.get(&worker_id) {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live connections.
    pub async fn connected_count(&self) -> usize {
        self.conns.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(mode: WorkerMode, labels: &[&str], concurrency: u32) -> WorkerRegistration {
        WorkerRegistration {
            name: "w".to_string(),
            hostname: "host".to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            mode,
            concurrency,
            version: "0.1.0".to_string(),
        }
    }

    async fn register_simple(
        hub: &WorkerHub,
        worker_id: WorkerId,
    ) -> (ConnId, mpsc::Receiver<ServerMessage>, CancellationToken) {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let conn_id = hub
            .register(
                worker_id,
                UserId::new(),
                registration(WorkerMode::Personal, &["linux"], 2),
                tx,
                cancel.clone(),
            )
            .await;
        (conn_id, rx, cancel)
    }

    #[tokio::test]
    async fn test_register_emits_event() {
        let (hub, mut events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        register_simple(&hub, worker_id).await;

        match events.recv().await.unwrap() {
            HubEvent::WorkerRegistered { worker_id: id } => assert_eq!(id, worker_id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(hub.connected_count().await, 1);
    }

    #[tokio::test]
    async fn test_collision_supersedes_first_connection() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();

        let (old_conn, mut old_rx, old_cancel) = register_simple(&hub, worker_id).await;
        let (_new_conn, _new_rx, _new_cancel) = register_simple(&hub, worker_id).await;

        // The first connection is cancelled and its channel closed.
        assert!(old_cancel.is_cancelled());
        assert!(old_rx.recv().await.is_none());
        assert_eq!(hub.connected_count().await, 1);

        // New connection receives sends; the old conn's unregister is a no-op.
        hub.unregister(worker_id, old_conn).await;
        assert_eq!(hub.connected_count().await, 1);
        assert!(hub.send(worker_id, ServerMessage::Drain).await);
    }

    #[tokio::test]
    async fn test_collision_carries_in_flight() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        let job_id = JobId::new();

        register_simple(&hub, worker_id).await;
        assert!(hub.assign(worker_id, job_id).await);

        register_simple(&hub, worker_id).await;
        assert!(hub.is_assigned(worker_id, job_id).await);
    }

    #[tokio::test]
    async fn test_unregister_emits_gone_with_in_flight() {
        let (hub, mut events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        let job_id = JobId::new();

        let (conn_id, _rx, _cancel) = register_simple(&hub, worker_id).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::WorkerRegistered { .. }
        ));

        hub.assign(worker_id, job_id).await;
        hub.unregister(worker_id, conn_id).await;

        match events.recv().await.unwrap() {
            HubEvent::WorkerGone {
                worker_id: id,
                in_flight,
            } => {
                assert_eq!(id, worker_id);
                assert_eq!(in_flight, vec![job_id]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(hub.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_is_assigned_authenticates_completions() {
        let (hub, _events) = WorkerHub::new();
        let worker_a = WorkerId::new();
        let worker_b = WorkerId::new();
        let job_id = JobId::new();

        register_simple(&hub, worker_a).await;
        register_simple(&hub, worker_b).await;
        hub.assign(worker_a, job_id).await;

        assert!(hub.is_assigned(worker_a, job_id).await);
        assert!(!hub.is_assigned(worker_b, job_id).await);
        assert!(!hub.is_assigned(WorkerId::new(), job_id).await);
    }

    #[tokio::test]
    async fn test_snapshot_returns_copies() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        register_simple(&hub, worker_id).await;

        let mut snapshot = hub.snapshot().await;
        snapshot[0].labels.insert("gpu".to_string());
        snapshot[0].in_flight = 99;

        // Mutating the copy did not touch hub state.
        let fresh = hub.snapshot().await;
        assert!(!fresh[0].labels.contains("gpu"));
        assert_eq!(fresh[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_marks_unhealthy() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();

        let (tx, _rx) = mpsc::channel(1);
        hub.register(
            worker_id,
            UserId::new(),
            registration(WorkerMode::Shared, &[], 1),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(hub.send(worker_id, ServerMessage::Drain).await);
        // Second send overflows the depth-1 buffer.
        assert!(!hub.send(worker_id, ServerMessage::Drain).await);
        assert!(hub.snapshot().await[0].unhealthy);
    }

    #[tokio::test]
    async fn test_drain_closes_when_idle() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        let (_conn, _rx, cancel) = register_simple(&hub, worker_id).await;

        assert!(hub.drain(worker_id).await);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        let job_id = JobId::new();
        let (_conn, mut rx, cancel) = register_simple(&hub, worker_id).await;

        hub.assign(worker_id, job_id).await;
        assert!(hub.drain(worker_id).await);
        assert!(!cancel.is_cancelled());
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Drain));

        hub.unassign(worker_id, job_id).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_force_disconnect() {
        let (hub, _events) = WorkerHub::new();
        let worker_id = WorkerId::new();
        let (_conn, _rx, cancel) = register_simple(&hub, worker_id).await;

        assert!(hub.force_disconnect(worker_id).await);
        assert!(cancel.is_cancelled());
        assert!(!hub.force_disconnect(WorkerId::new()).await);
    }
}
