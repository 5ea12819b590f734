//! tailgate gateway: the HTTP/SSE surface over the streaming core.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod ratelimit;
pub mod routes;
pub mod sse;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

pub use routes::AppState;

/// Build the router. No write timeout is configured anywhere on this path:
/// long-lived streams must never be killed by the server side.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/api/v1/namespaces/{ns}/pods/{name}/logs", get(routes::pod_logs))
        .route("/api/v1/namespaces/{ns}/apps/{name}/logs", get(routes::app_logs))
        .with_state(state)
}
