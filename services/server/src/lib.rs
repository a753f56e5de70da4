pub mod auth;
pub mod http;
pub mod rate_limit;
pub mod state;
pub mod ws_common;
pub mod ws_device;

pub use state::{AppState, PublishOutcome, ServerConfig};

use axum::{
    Router,
    routing::{get, post, put},
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/devices", get(ws_device::ws_device_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/v1/sessions", post(http::sessions::create_session))
        .route(
            "/api/v1/sessions/{session_id}",
            get(http::sessions::get_session),
        )
        .route(
            "/api/v1/sessions/{session_id}/schema",
            put(http::sessions::publish_schema),
        )
        .with_state(state)
}
