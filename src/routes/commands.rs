//! Operator command endpoint.
//!
//! `POST /api/commands` with `{deviceId, command}` publishes the command to
//! the device through the dispatcher, which also writes the system log.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::{error_response, AppState};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/commands", post(send_command))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    device_id: Option<String>,
    command: Option<String>,
}

async fn send_command(State(service): State<AppState>, Json(req): Json<CommandRequest>) -> Response {
    // ---
    let device_id = req.device_id.unwrap_or_default();
    let command = req.command.unwrap_or_default();
    if device_id.trim().is_empty() || command.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing deviceId or command");
    }

    match service.dispatcher().send(device_id.trim(), &command).await {
        Ok(()) => Json(json!({ "success": true, "message": "Command sent" })).into_response(),
        Err(e) => {
            error!(device_id = %device_id, "Failed to send command: {e:#}");
            error_response(StatusCode::BAD_GATEWAY, "Failed to send command")
        }
    }
}
