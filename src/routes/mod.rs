//! HTTP gateway (EMBP).
//!
//! Each sibling module exports one subrouter over the shared
//! [`IngestService`]; this module merges them so `main.rs` never needs to
//! know about individual endpoints.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use crate::ingest::IngestService;

mod ai;
mod commands;
mod devices;
mod health;
mod ws;

// ---

pub type AppState = Arc<IngestService>;

pub fn router(service: AppState) -> Router {
    // ---
    Router::new()
        .merge(ai::router())
        .merge(devices::router())
        .merge(commands::router())
        .merge(ws::router())
        .merge(health::router())
        .with_state(service)
}

/// JSON error body shared by the route modules.
fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
