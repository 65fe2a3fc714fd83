//! # Operator HTTP surface.
//!
//! Exposes the dispensing cycle to the operator application as an async
//! HTTP service using `axum` + `tokio`.
//!
//! Endpoints:
//! - `GET  /ping`                - liveness probe (pre-auth)
//! - `POST /api/auth`            - challenge/response login
//! - `POST /api/fill`            - begin a refill (Idle only)
//! - `POST /api/drf-submit`      - odometer submission (AwaitingOdometer only)
//! - `GET  /api/state`           - full status snapshot
//! - `POST /api/operation`       - token-authenticated request façade
//! - `GET  /api/hls/{socket_id}` - liquid-level sensor read (sockets 3, 4)
//! - `POST /api/uart`            - diagnostic passthrough
//! - `POST /api/upload`          - multipart image upload
//!
//! All responses are JSON. CORS is permissive: the operator application is
//! served from a different origin on the same vehicle network.
//!
//! State-guard violations are rejected at this boundary with a 400 and
//! `{ error, currentState, allowedState }`; they never mutate supervisor
//! state.

mod auth;
mod handlers;
mod operation;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_auth, handle_drf_submit, handle_fill, handle_hls, handle_not_found, handle_operation,
    handle_ping, handle_state, handle_uart, handle_upload,
};

pub use auth::{Authenticate, Md5Authenticator, SessionStore};
pub use state::AppState;

/// Maximum request body size: 10 MB (bounded by the image uploads).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

/// Builds the operator router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(handle_ping))
        .route("/api/auth", post(handle_auth))
        .route("/api/fill", post(handle_fill))
        .route("/api/drf-submit", post(handle_drf_submit))
        .route("/api/state", get(handle_state))
        .route("/api/operation", post(handle_operation))
        .route("/api/hls/{socket_id}", get(handle_hls))
        .route("/api/uart", post(handle_uart))
        .route("/api/upload", post(handle_upload))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
