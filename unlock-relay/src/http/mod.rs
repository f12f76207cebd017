//! HTTP endpoints for unlock-relay.
//!
//! Provides the unlock API plus health checks and metrics.

pub mod health;
mod metrics;
pub mod unlock;

use crate::server::UnlockRelay;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<UnlockRelay>) -> Router {
    let body_limit = relay.config().limits.max_message_bytes;

    let api = Router::new()
        .route("/stream", get(unlock::stream_handler))
        .route("/message", post(unlock::send_handler))
        .route("/heartbeat", post(unlock::heartbeat_handler))
        .route("/approvers", get(unlock::approvers_handler));

    let mut router = Router::new()
        .nest("/api/unlock", api)
        .route("/health", get(health::health_handler));
    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(relay))
}
