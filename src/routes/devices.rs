//! Device snapshot lookup.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use super::{error_response, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/devices/{device_id}", get(device))
}

/// Sanitized snapshot: merged config plus state, online flag and last-seen
/// time. The claim token never appears.
async fn device(State(service): State<AppState>, Path(device_id): Path<String>) -> Response {
    // ---
    match service.store().get(&device_id) {
        Some(device) => Json(device.sanitized()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Device not found"),
    }
}
