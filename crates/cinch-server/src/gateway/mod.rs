mod api;
mod server;
mod viewer_socket;
mod worker_socket;

pub use server::{AppState, GatewayServer};
