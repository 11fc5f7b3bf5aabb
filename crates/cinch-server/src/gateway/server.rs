use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use cinch_core::config::{DispatchConfig, GatewayConfig};
use cinch_core::error::CinchError;

use crate::dispatch::DispatcherHandle;
use crate::hub::WorkerHub;
use crate::ingress::Ingress;
use crate::logbus::LogBus;
use crate::store::Store;

use super::api;
use super::viewer_socket::viewer_ws_handler;
use super::worker_socket::worker_ws_handler;

/// Shared state for every gateway handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: Arc<WorkerHub>,
    pub logbus: Arc<LogBus>,
    pub dispatcher: DispatcherHandle,
    pub ingress: Arc<Ingress>,
    pub dispatch_config: DispatchConfig,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// The public HTTP + WebSocket surface.
pub struct GatewayServer {
    config: GatewayConfig,
    state: AppState,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        Router::new()
            // Health check endpoint
            .route("/health", get(health_handler))
            // Webhook intake: per-forge path plus header-identified catch-all
            .route("/hooks", post(api::webhook_any))
            .route("/hooks/{forge}", post(api::webhook_forge))
            // Worker stream
            .route("/api/workers/connect", any(worker_ws_handler))
            // Worker management
            .route("/api/workers", get(api::list_workers))
            .route("/api/workers/{id}/drain", post(api::drain_worker))
            .route("/api/workers/{id}/disconnect", post(api::disconnect_worker))
            // Jobs
            .route("/api/jobs/{id}", get(api::get_job))
            .route("/api/jobs/{id}/approve", post(api::approve_job))
            .route("/api/jobs/{id}/cancel", post(api::cancel_job))
            .route("/api/jobs/{id}/retry", post(api::retry_job))
            .route("/api/jobs/{id}/logs", get(api::get_job_logs))
            // Viewer stream
            .route("/api/jobs/{id}/logs/stream", any(viewer_ws_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// The socket address to bind to.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.config.port))
    }

    /// Run the server until the listener fails.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!("Gateway listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    }
}

/// Health check handler.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Translate the error taxonomy onto HTTP statuses.
pub struct ApiError(pub CinchError);

impl From<CinchError> for ApiError {
    fn from(e: CinchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CinchError::Auth(_) => StatusCode::UNAUTHORIZED,
            CinchError::Forbidden(_) => StatusCode::FORBIDDEN,
            CinchError::Validation(_) | CinchError::Protocol(_) => StatusCode::BAD_REQUEST,
            CinchError::NotFound(_) => StatusCode::NOT_FOUND,
            CinchError::Conflict(_) => StatusCode::CONFLICT,
            CinchError::Upstream(_) => StatusCode::BAD_GATEWAY,
            CinchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self.0);
        }

        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        fn status_of(e: CinchError) -> StatusCode {
            ApiError(e).into_response().status()
        }

        assert_eq!(
            status_of(CinchError::Auth("bad signature".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(CinchError::Validation("bad config".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(CinchError::NotFound("repo".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CinchError::Conflict("state".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CinchError::Internal("bug".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_health_response_serialization() {
        let resp = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("healthy"));
    }
}
