//! Health and prediction endpoints under `/api/ai`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{error_response, AppState};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/ai/health", get(system_health))
        .route("/api/ai/health/{device_id}", get(device_health))
        .route("/api/ai/health/{device_id}/reset", post(reset_health))
        .route("/api/ai/predict", post(predict))
}

async fn system_health(State(service): State<AppState>) -> Response {
    Json(service.detector().system_assessment()).into_response()
}

async fn device_health(
    State(service): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    // ---
    match service.device_health(&device_id) {
        Some(assessment) => Json(assessment).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Device not found"),
    }
}

async fn reset_health(
    State(service): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    // ---
    if !service.is_known(&device_id) {
        return error_response(StatusCode::NOT_FOUND, "Device not found");
    }
    info!(device_id = %device_id, "POST /api/ai/health/reset");
    Json(service.reset_health(&device_id).await).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    current_moisture: Option<f64>,
    temp: Option<f64>,
    humidity: Option<f64>,
    threshold: Option<f64>,
}

async fn predict(State(service): State<AppState>, Json(req): Json<PredictRequest>) -> Response {
    // ---
    let (Some(moisture), Some(temperature), Some(humidity)) =
        (req.current_moisture, req.temp, req.humidity)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "currentMoisture, temp and humidity are required",
        );
    };
    let threshold = req.threshold.unwrap_or(service.settings().dry_threshold);

    match service
        .predictor()
        .predict(moisture, threshold, temperature, humidity)
    {
        Some(hours) => Json(json!({ "hoursUntilDry": hours })).into_response(),
        None => error_response(StatusCode::BAD_REQUEST, "inputs must be finite numbers"),
    }
}
