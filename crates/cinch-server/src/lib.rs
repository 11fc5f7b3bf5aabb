pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod forge;
pub mod gateway;
pub mod hub;
pub mod ingress;
pub mod logbus;
pub mod maintenance;
pub mod migrations;
pub mod relay;
pub mod store;

pub use db::Database;
pub use dispatch::{Dispatcher, DispatcherHandle, StatusPoster};
pub use forge::Forge;
pub use gateway::{AppState, GatewayServer};
pub use hub::{HubEvent, WorkerHub, WorkerSnapshot};
pub use ingress::{Ingress, IngressOutcome};
pub use logbus::{LogBus, LogStore, MemoryLogStore};
pub use maintenance::MaintenanceLoop;
pub use migrations::{Migration, MigrationRunner};
pub use relay::RelayClient;
pub use store::{PostgresLogStore, Store};
