//! Background maintenance.
//!
//! One periodic task owns the cleanup work: expired token revocation, log
//! retention, and stale offline worker rows. Nothing here is spawned
//! per-request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cinch_core::config::MaintenanceConfig;

use crate::logbus::LogStore;
use crate::store::Store;

/// The periodic sweeper.
pub struct MaintenanceLoop {
    store: Store,
    logstore: Arc<dyn LogStore>,
    config: MaintenanceConfig,
}

impl MaintenanceLoop {
    pub fn new(store: Store, logstore: Arc<dyn LogStore>, config: MaintenanceConfig) -> Self {
        Self {
            store,
            logstore,
            config,
        }
    }

    /// Run until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Maintenance loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.store.sweep_expired_tokens().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(tokens = n, "Revoked expired worker tokens"),
            Err(e) => tracing::warn!("Token sweep failed: {}", e),
        }

        let log_cutoff = Utc::now() - chrono::Duration::days(self.config.log_retention_days as i64);
        match self.logstore.delete_before(log_cutoff).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(chunks = n, "Deleted expired log chunks"),
            Err(e) => tracing::warn!("Log retention sweep failed: {}", e),
        }

        let worker_cutoff =
            Utc::now() - chrono::Duration::days(self.config.offline_worker_retention_days as i64);
        match self.store.delete_stale_workers(worker_cutoff).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(workers = n, "Removed stale worker rows"),
            Err(e) => tracing::warn!("Worker sweep failed: {}", e),
        }
    }
}
