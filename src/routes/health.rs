// src/routes/health.rs
//! Liveness check for the PlantCare telemetry service.
//!
//! `GET /health` answers as long as the HTTP server is up. It does not touch
//! the database or the broker, so orchestrators can use it without causing
//! load. Follows the Explicit Module Boundary Pattern (EMBP): the handler
//! stays private and only the subrouter is exported to the gateway.

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
    })
}

/// Subrouter with the `/health` route, generic over the gateway state so it
/// merges regardless of what the other routes share.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
