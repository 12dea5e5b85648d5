//! REST / WS / SSE surface.

mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};

use crate::handlers::PendingMetrics;
use crate::hub::Hub;
use crate::transfer::TransferManager;

/// Shared state for the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub transfer: Arc<TransferManager>,
    pub pending: PendingMetrics,
    pub started: Instant,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/agents", get(handlers::list_agents))
        .route("/api/v1/agents/:id", get(handlers::get_agent))
        .route("/api/v1/agents/:id/metrics", get(handlers::agent_metrics))
        .route("/api/v1/agents/:id/restart", post(handlers::restart_agent))
        .route(
            "/api/v1/agents/:id/uninstall",
            post(handlers::uninstall_agent),
        )
        .route(
            "/api/v1/agents/:id/filesystem/:source",
            post(handlers::request_transfer),
        )
        .route("/ws", get(handlers::ws_upgrade))
        .route("/sse", get(handlers::sse_stream))
        .with_state(state)
}
