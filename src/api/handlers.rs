//! Operator HTTP route handlers.
//!
//! Handlers never mutate supervisor state directly: state-changing
//! requests go through the command channel and wait for the machine's
//! verdict; polls answer from the latest snapshot. Every handler
//! refreshes the operator-contact watch.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::health::Watch;
use crate::port::Command;
use crate::supervisor::{CommandKind, CommandOutcome, OperatorCommand};

use super::operation;
use super::state::AppState;
use super::json_error;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /ping - the operator application probes this before logging in.
pub(crate) async fn handle_ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    "pong"
}

/// POST /api/auth - two-step challenge/response.
pub(crate) async fn handle_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    let username = body["username"].as_str().unwrap_or_default().to_string();
    if username.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "username required").into_response();
    }

    match body["key"].as_str() {
        None => {
            let challenge = state.sessions.issue_challenge(&username);
            (
                StatusCode::OK,
                Json(json!({
                    "username": username,
                    "challenge": challenge,
                    "state": "challenge",
                })),
            )
                .into_response()
        }
        Some(key) => match state.sessions.redeem(&username, key, state.authenticator.as_ref()) {
            Some(token) => (StatusCode::OK, Json(json!({ "token": token }))).into_response(),
            None => (StatusCode::UNAUTHORIZED, Json(json!({ "token": "" }))).into_response(),
        },
    }
}

/// Sends a command into the machine and waits for the verdict.
pub(crate) async fn dispatch(
    state: &AppState,
    kind: CommandKind,
) -> Result<CommandOutcome, StatusCode> {
    let (tx, rx) = oneshot::channel();
    state
        .commands
        .send(OperatorCommand {
            kind,
            reply: Some(tx),
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    rx.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Notifies the machine of a status poll without waiting.
fn notify_poll(state: &AppState) {
    let _ = state.commands.try_send(OperatorCommand {
        kind: CommandKind::StatusPolled,
        reply: None,
    });
}

/// Renders an outcome as the `{ state }` / `{ error, currentState,
/// allowedState }` pair the operator application expects.
fn outcome_to_http(outcome: CommandOutcome) -> axum::response::Response {
    match outcome {
        CommandOutcome::Accepted { state } => {
            (StatusCode::OK, Json(json!({ "state": state.as_str() }))).into_response()
        }
        CommandOutcome::Rejected {
            error,
            current,
            allowed,
        } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": error,
                "currentState": current.as_str(),
                "allowedState": allowed.as_str(),
            })),
        )
            .into_response(),
    }
}

/// POST /api/fill - requires Idle; begins a refill.
pub(crate) async fn handle_fill(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    match dispatch(&state, CommandKind::StartRefill).await {
        Err(code) => json_error(code, "supervisor unavailable").into_response(),
        Ok(outcome) => outcome_to_http(outcome),
    }
}

/// Accepts `{ "kilometers": 250 }` and `{ "kilometers": "250" }` alike.
pub(crate) fn parse_kilometers(value: &Value) -> Option<i64> {
    match &value["kilometers"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// POST /api/drf-submit - requires AwaitingOdometer and `0..=1000`.
pub(crate) async fn handle_drf_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    let Some(kilometers) = parse_kilometers(&body) else {
        let snapshot = state.status.borrow().clone();
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "kilometers must be an integer",
                "currentState": snapshot.state,
                "allowedState": "AwaitingOdometer",
            })),
        )
            .into_response();
    };
    match dispatch(&state, CommandKind::SubmitOdometer { hours: kilometers }).await {
        Err(code) => json_error(code, "supervisor unavailable").into_response(),
        Ok(outcome) => outcome_to_http(outcome),
    }
}

/// GET /api/state - the full snapshot.
pub(crate) async fn handle_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    notify_poll(&state);
    let snapshot = state.status.borrow().clone();
    (StatusCode::OK, Json(snapshot))
}

/// POST /api/operation - the token-authenticated façade.
pub(crate) async fn handle_operation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    let token = body["token"].as_str().unwrap_or_default();
    if !state.sessions.is_valid(token) {
        return Json(operation::invalid_token()).into_response();
    }

    let request = body["request"].as_str().unwrap_or_default();
    let response = match request {
        "refill_req" => match dispatch(&state, CommandKind::StartRefill).await {
            Ok(outcome) => operation::outcome_response("refill_started", &outcome),
            Err(_) => operation::invalid("supervisor unavailable"),
        },
        "refill_drf" => {
            let hours = match &body["refill_op_workinghours"] {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            match hours {
                None => operation::invalid("working hours missing"),
                Some(h) => match dispatch(&state, CommandKind::SubmitOdometer { hours: h }).await
                {
                    Ok(outcome) => operation::outcome_response("refill_drf", &outcome),
                    Err(_) => operation::invalid("supervisor unavailable"),
                },
            }
        }
        "refill_finish" => match dispatch(&state, CommandKind::ForceFinish).await {
            Ok(outcome) => operation::outcome_response("refill_finished", &outcome),
            Err(_) => operation::invalid("supervisor unavailable"),
        },
        "refill_params" => {
            notify_poll(&state);
            operation::params_response(&state.status.borrow().clone())
        }
        "vehicle_info" => {
            notify_poll(&state);
            operation::vehicle_info_response(&state.status.borrow().clone())
        }
        _ => operation::invalid("unknown request"),
    };
    Json(response).into_response()
}

/// GET /api/hls/{socket_id} - liquid-level sensor read, sockets 3 and 4.
pub(crate) async fn handle_hls(
    State(state): State<Arc<AppState>>,
    Path(socket_id): Path<u8>,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    if !matches!(socket_id, 3 | 4) {
        return json_error(StatusCode::BAD_REQUEST, "socket must be 3 or 4").into_response();
    }
    match state
        .port
        .request(Command::HlsRead {
            denominator: 500,
            socket: socket_id,
        })
        .await
    {
        Ok(frame) => match frame.hls_payload() {
            Some((value, denominator)) => (
                StatusCode::OK,
                Json(json!({
                    "hlsId": socket_id,
                    "meterRead": value.to_string(),
                    "denominator": denominator,
                    "timestamp": Utc::now().timestamp_millis(),
                })),
            )
                .into_response(),
            None => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "malformed hls reply")
                    .into_response()
            }
        },
        Err(err) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()).into_response()
        }
    }
}

/// POST /api/uart - diagnostic passthrough, written verbatim.
pub(crate) async fn handle_uart(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    let Some(command) = body["command"].as_str() else {
        return json_error(StatusCode::BAD_REQUEST, "command required").into_response();
    };
    match state.port.send(Command::Raw(command.to_string())).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "sent": true }))).into_response(),
        Err(err) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()).into_response()
        }
    }
}

/// POST /api/upload - multipart image upload, millis-prefixed filename.
pub(crate) async fn handle_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    state.health.touch(Watch::Operator);
    while let Ok(Some(field)) = multipart.next_field().await {
        let original = field
            .file_name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        // Strip any client-supplied path components.
        let base = std::path::Path::new(&original)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(err) => {
                return json_error(StatusCode::BAD_REQUEST, &err.to_string()).into_response()
            }
        };
        let name = format!("{}_{base}", Utc::now().timestamp_millis());
        let target = state.upload_dir.join(&name);
        if let Err(err) = tokio::fs::create_dir_all(&state.upload_dir).await {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                .into_response();
        }
        if let Err(err) = tokio::fs::write(&target, &bytes).await {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                .into_response();
        }
        return (StatusCode::OK, Json(json!({ "saved": name }))).into_response();
    }
    json_error(StatusCode::BAD_REQUEST, "no file field").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kilometers_accept_integer_and_string_forms() {
        assert_eq!(parse_kilometers(&json!({ "kilometers": 250 })), Some(250));
        assert_eq!(parse_kilometers(&json!({ "kilometers": "250" })), Some(250));
        assert_eq!(parse_kilometers(&json!({ "kilometers": " 1000 " })), Some(1000));
        assert_eq!(parse_kilometers(&json!({ "kilometers": 12.5 })), None);
        assert_eq!(parse_kilometers(&json!({ "kilometers": "abc" })), None);
        assert_eq!(parse_kilometers(&json!({})), None);
    }
}
