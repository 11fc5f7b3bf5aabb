//! Cinch control plane runtime.
//!
//! Single binary wiring: database + migrations, the store, the forge
//! adapters, the worker hub, the dispatcher, the log bus, the gateway,
//! background maintenance, and the optional relay link.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cinch_core::config::CinchConfig;
use cinch_core::error::{CinchError, Result};

use cinch_server::crypto::SecretCipher;
use cinch_server::dispatch::{Dispatcher, StatusPoster};
use cinch_server::logbus::LogStore;
use cinch_server::{
    AppState, Database, Forge, GatewayServer, Ingress, LogBus, MaintenanceLoop, MigrationRunner,
    PostgresLogStore, RelayClient, Store, WorkerHub,
};

/// The assembled control plane.
pub struct Cinch {
    config: CinchConfig,
}

impl Cinch {
    pub fn new(config: CinchConfig) -> Self {
        Self { config }
    }

    /// Connect and apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let db = Database::from_config(&self.config.database).await?;
        MigrationRunner::new(db.pool().clone()).run(Vec::new()).await?;
        db.close().await;
        Ok(())
    }

    /// Run the control plane until ctrl-c.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Cinch control plane starting");

        let db = Database::from_config(&self.config.database).await?;
        let pool = db.pool().clone();
        tracing::info!("Connected to database");

        // Only one node applies migrations; the advisory lock serializes
        // the rest.
        MigrationRunner::new(pool.clone()).run(Vec::new()).await?;

        let cipher = match &self.config.security.master_key {
            Some(key) => SecretCipher::from_hex_key(key)?,
            None => {
                tracing::warn!("No master key configured; secrets are stored unencrypted");
                SecretCipher::disabled()
            }
        };
        let store = Store::new(pool.clone(), cipher);

        let http = reqwest::Client::builder()
            .user_agent(concat!("cinch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CinchError::Internal(format!("HTTP client setup failed: {}", e)))?;
        let forge = Forge::new(http);

        let logstore: Arc<dyn LogStore> = Arc::new(PostgresLogStore::new(pool.clone()));
        let logbus = Arc::new(LogBus::new(logstore.clone()));

        let (hub, hub_events) = WorkerHub::new();

        let status = StatusPoster::start(
            store.clone(),
            forge.clone(),
            self.config.dispatch.status_post_retries,
        );

        let external_url = self.config.gateway.external_url.clone();
        let (dispatcher, dispatcher_handle) = Dispatcher::new(
            store.clone(),
            hub.clone(),
            hub_events,
            logbus.clone(),
            forge.clone(),
            status.clone(),
            self.config.dispatch.clone(),
            external_url.clone(),
        );

        let ingress = Arc::new(Ingress::new(
            store.clone(),
            forge,
            dispatcher_handle.clone(),
            status,
            self.config.dispatch.default_timeout_secs,
            external_url,
        ));

        let state = AppState {
            store: store.clone(),
            hub,
            logbus,
            dispatcher: dispatcher_handle,
            ingress,
            dispatch_config: self.config.dispatch.clone(),
        };
        let gateway = GatewayServer::new(self.config.gateway.clone(), state);

        let shutdown = CancellationToken::new();

        tokio::spawn(dispatcher.run(shutdown.clone()));
        tokio::spawn(
            MaintenanceLoop::new(store, logstore, self.config.maintenance.clone())
                .run(shutdown.clone()),
        );
        if let Some(relay_config) = self.config.relay.clone() {
            tracing::info!("Relay client enabled: {}", relay_config.url);
            tokio::spawn(
                RelayClient::new(relay_config, self.config.gateway.port).run(shutdown.clone()),
            );
        }

        let result = tokio::select! {
            result = gateway.run() => {
                result.map_err(|e| CinchError::Internal(format!("gateway failed: {}", e)))
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
        };

        shutdown.cancel();
        db.close().await;
        tracing::info!("Cinch control plane stopped");
        result
    }
}
