//! API route definitions

use crate::handlers::{annotate, health};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Liveness routes kept from the original service
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health::root))
        .route("/status", get(health::status))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::prometheus_metrics))
}

/// Annotation routes
pub fn annotate_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/annotate_strings", post(annotate::annotate_strings))
        .route("/api/v1/annotate", post(annotate::annotate_batch))
}
