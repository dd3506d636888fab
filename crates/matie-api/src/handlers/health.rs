//! Liveness and metrics handlers

use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

/// Root greeting
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses(
        (status = 200, description = "Greeting")
    )
)]
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "hello": "world" }))
}

/// Plain status string
#[utoipa::path(
    get,
    path = "/status",
    tag = "health",
    responses(
        (status = 200, description = "Service is up", body = String)
    )
)]
pub async fn status() -> impl IntoResponse {
    Json("Service is up!")
}

/// Health check response
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Liveness probe - basic health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
    })
}

/// Prometheus-compatible metrics endpoint
pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut output = String::new();

    output.push_str("# HELP matie_uptime_seconds Time since server start\n");
    output.push_str("# TYPE matie_uptime_seconds gauge\n");
    output.push_str(&format!("matie_uptime_seconds {}\n", state.uptime_secs()));

    output.push_str("# HELP matie_http_requests_served Requests handled since start\n");
    output.push_str("# TYPE matie_http_requests_served counter\n");
    output.push_str(&format!(
        "matie_http_requests_served {}\n",
        state.get_request_count()
    ));

    output.push_str(&matie_runner::metrics::gather_text());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        output,
    )
}
