//! Metrics tracking middleware
//!
//! Tracks request counts, latency and status codes for Prometheus metrics

use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use std::sync::Arc;
use std::time::Instant;

use matie_runner::metrics::register;

lazy_static! {
    static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("matie_http_requests_total", "HTTP requests by endpoint and status"),
        &["endpoint", "status"],
    ));
    static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register(HistogramVec::new(
        HistogramOpts::new("matie_http_request_duration_seconds", "HTTP request latency"),
        &["endpoint"],
    ));
}

/// Metrics tracking middleware
///
/// Records:
/// - Request count per endpoint and status code
/// - Request latency distribution
pub async fn metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let endpoint = normalize_endpoint(request.uri().path());

    state.increment_requests();
    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[endpoint, status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Map a request path to a bounded set of metric labels
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/status" => "/status",
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/annotate_strings" => "/annotate_strings",
        "/api/v1/annotate" => "/api/v1/annotate",
        "/api-docs/openapi.json" => "/api-docs/openapi.json",
        _ => "other",
    }
}
