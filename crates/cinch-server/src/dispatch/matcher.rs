//! Matching policy: trust gate, label gate, availability gate, tie-break.
//!
//! Pure functions over hub snapshots so the policy is testable without a
//! database or live connections.

use cinch_core::model::{TrustLevel, UserId, WorkerMode};

use crate::hub::WorkerSnapshot;

/// Trust gate.
///
/// Owner jobs run on the repo owner's personal workers; collaborator jobs
/// may also use the owner's shared workers; external jobs (fork PRs,
/// unknown senders) reach shared workers only, and only after approval
/// released them from the held state.
pub fn trust_allows(trust: TrustLevel, repo_owner: UserId, worker: &WorkerSnapshot) -> bool {
    match trust {
        TrustLevel::Owner => {
            worker.mode == WorkerMode::Personal && worker.owner_user_id == repo_owner
        }
        TrustLevel::Collaborator => worker.owner_user_id == repo_owner,
        TrustLevel::External => worker.mode == WorkerMode::Shared,
    }
}

/// Label gate. Tuples are OR-ed; within a tuple every label must be in
/// the worker's advertised set. No tuples means any worker.
pub fn labels_allow(tuples: &[Vec<String>], worker: &WorkerSnapshot) -> bool {
    if tuples.is_empty() {
        return true;
    }
    tuples
        .iter()
        .any(|tuple| tuple.iter().all(|label| worker.labels.contains(label)))
}

/// Availability gate: online, healthy, and with a free slot.
pub fn available(worker: &WorkerSnapshot) -> bool {
    worker.status.can_accept_work() && !worker.unhealthy && worker.free_slots() > 0
}

/// Pick the worker for a job, or None when nothing qualifies.
///
/// Tie-break: fewest in-flight, then oldest last-assignment, then
/// lexicographic worker id. Stable and starvation-free.
pub fn select_worker<'a>(
    trust: TrustLevel,
    repo_owner: UserId,
    label_tuples: &[Vec<String>],
    workers: &'a [WorkerSnapshot],
) -> Option<&'a WorkerSnapshot> {
    workers
        .iter()
        .filter(|w| trust_allows(trust, repo_owner, w))
        .filter(|w| labels_allow(label_tuples, w))
        .filter(|w| available(w))
        .min_by_key(|w| (w.in_flight, w.last_assigned_at, w.worker_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use cinch_core::model::{WorkerId, WorkerStatus};
    use std::collections::BTreeSet;

    fn snapshot(
        owner: UserId,
        mode: WorkerMode,
        labels: &[&str],
        concurrency: u32,
        in_flight: usize,
    ) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: WorkerId::new(),
            owner_user_id: owner,
            name: "w".to_string(),
            hostname: "host".to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            mode,
            concurrency,
            version: "0.1.0".to_string(),
            status: WorkerStatus::Online,
            in_flight,
            unhealthy: false,
            last_assigned_at: None,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_owner_trust_requires_owned_personal() {
        let owner = UserId::new();
        let stranger = UserId::new();

        let own_personal = snapshot(owner, WorkerMode::Personal, &[], 1, 0);
        let own_shared = snapshot(owner, WorkerMode::Shared, &[], 1, 0);
        let foreign_personal = snapshot(stranger, WorkerMode::Personal, &[], 1, 0);

        assert!(trust_allows(TrustLevel::Owner, owner, &own_personal));
        assert!(!trust_allows(TrustLevel::Owner, owner, &own_shared));
        assert!(!trust_allows(TrustLevel::Owner, owner, &foreign_personal));
    }

    #[test]
    fn test_collaborator_trust_allows_owner_workers() {
        let owner = UserId::new();
        let stranger = UserId::new();

        assert!(trust_allows(
            TrustLevel::Collaborator,
            owner,
            &snapshot(owner, WorkerMode::Personal, &[], 1, 0)
        ));
        assert!(trust_allows(
            TrustLevel::Collaborator,
            owner,
            &snapshot(owner, WorkerMode::Shared, &[], 1, 0)
        ));
        assert!(!trust_allows(
            TrustLevel::Collaborator,
            owner,
            &snapshot(stranger, WorkerMode::Shared, &[], 1, 0)
        ));
    }

    #[test]
    fn test_external_trust_never_reaches_personal() {
        let owner = UserId::new();

        // Not even the repo owner's own personal worker.
        assert!(!trust_allows(
            TrustLevel::External,
            owner,
            &snapshot(owner, WorkerMode::Personal, &[], 1, 0)
        ));
        assert!(trust_allows(
            TrustLevel::External,
            owner,
            &snapshot(owner, WorkerMode::Shared, &[], 1, 0)
        ));
        assert!(trust_allows(
            TrustLevel::External,
            owner,
            &snapshot(UserId::new(), WorkerMode::Shared, &[], 1, 0)
        ));
    }

    #[test]
    fn test_label_gate_single_tuple_is_subset_test() {
        let owner = UserId::new();
        let worker = snapshot(owner, WorkerMode::Personal, &["linux", "gpu"], 1, 0);

        // A worker lacking any label of the tuple never matches.
        let gpu_and_macos = vec![vec!["gpu".to_string(), "macos".to_string()]];
        assert!(!labels_allow(&gpu_and_macos, &worker));

        let gpu_and_linux = vec![vec!["gpu".to_string(), "linux".to_string()]];
        assert!(labels_allow(&gpu_and_linux, &worker));
    }

    #[test]
    fn test_label_gate_or_across_tuples() {
        let owner = UserId::new();
        let worker = snapshot(owner, WorkerMode::Personal, &["macos"], 1, 0);

        let tuples = vec![
            vec!["linux".to_string(), "gpu".to_string()],
            vec!["macos".to_string()],
        ];
        assert!(labels_allow(&tuples, &worker));
    }

    #[test]
    fn test_empty_tuples_match_anything() {
        let owner = UserId::new();
        assert!(labels_allow(&[], &snapshot(owner, WorkerMode::Personal, &[], 1, 0)));
    }

    #[test]
    fn test_availability_gate() {
        let owner = UserId::new();

        let mut full = snapshot(owner, WorkerMode::Personal, &[], 2, 2);
        assert!(!available(&full));
        full.in_flight = 1;
        assert!(available(&full));

        let mut draining = snapshot(owner, WorkerMode::Personal, &[], 2, 0);
        draining.status = WorkerStatus::Draining;
        assert!(!available(&draining));

        let mut unhealthy = snapshot(owner, WorkerMode::Personal, &[], 2, 0);
        unhealthy.unhealthy = true;
        assert!(!available(&unhealthy));
    }

    #[test]
    fn test_tie_break_fewest_in_flight() {
        let owner = UserId::new();
        let busy = snapshot(owner, WorkerMode::Personal, &[], 4, 3);
        let idle = snapshot(owner, WorkerMode::Personal, &[], 4, 1);

        let workers = vec![busy, idle.clone()];
        let picked = select_worker(TrustLevel::Owner, owner, &[], &workers).unwrap();
        assert_eq!(picked.worker_id, idle.worker_id);
    }

    #[test]
    fn test_tie_break_oldest_assignment() {
        let owner = UserId::new();
        let mut recent = snapshot(owner, WorkerMode::Personal, &[], 2, 1);
        recent.last_assigned_at = Some(Utc::now());
        let mut stale = snapshot(owner, WorkerMode::Personal, &[], 2, 1);
        stale.last_assigned_at = Some(Utc::now() - Duration::minutes(10));

        let workers = vec![recent, stale.clone()];
        let picked = select_worker(TrustLevel::Owner, owner, &[], &workers).unwrap();
        assert_eq!(picked.worker_id, stale.worker_id);
    }

    #[test]
    fn test_no_eligible_worker() {
        let owner = UserId::new();
        let workers = vec![snapshot(UserId::new(), WorkerMode::Personal, &[], 2, 0)];
        assert!(select_worker(TrustLevel::Owner, owner, &[], &workers).is_none());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let owner = UserId::new();
        let a = snapshot(owner, WorkerMode::Personal, &[], 2, 0);
        let b = snapshot(owner, WorkerMode::Personal, &[], 2, 0);

        let workers = vec![a.clone(), b.clone()];
        let expected = a.worker_id.min(b.worker_id);
        for _ in 0..3 {
            let picked = select_worker(TrustLevel::Owner, owner, &[], &workers).unwrap();
            assert_eq!(picked.worker_id, expected);
        }
    }
}
