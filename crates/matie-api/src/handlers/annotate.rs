//! Batch annotation handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};

use crate::error::{ApiError, AppError};
use crate::state::AppState;
use matie_core::{BatchReport, DocumentOutcome};

/// Annotate a mapping of document key to raw text
///
/// Returns one outcome per key. Annotated keys carry `text`, `entities` and
/// `relations`; keys without a usable decoder result carry `status: failed`.
#[utoipa::path(
    post,
    path = "/annotate_strings",
    tag = "annotate",
    request_body = BTreeMap<String, String>,
    responses(
        (status = 200, description = "Per-key annotation outcome", body = BTreeMap<String, DocumentOutcome>),
        (status = 400, description = "Invalid or colliding document keys", body = ApiError),
        (status = 500, description = "Workspace could not be allocated", body = ApiError)
    )
)]
pub async fn annotate_strings(
    State(state): State<Arc<AppState>>,
    Json(key_to_string): Json<BTreeMap<String, String>>,
) -> Result<Json<BTreeMap<String, DocumentOutcome>>, AppError> {
    let report = state.coordinator.annotate(key_to_string).await?;
    Ok(Json(report.documents))
}

/// Annotate a batch and return the full report, including decoder runs
#[utoipa::path(
    post,
    path = "/api/v1/annotate",
    tag = "annotate",
    request_body = BTreeMap<String, String>,
    responses(
        (status = 200, description = "Batch report", body = BatchReport),
        (status = 400, description = "Invalid or colliding document keys", body = ApiError),
        (status = 500, description = "Workspace could not be allocated", body = ApiError)
    )
)]
pub async fn annotate_batch(
    State(state): State<Arc<AppState>>,
    Json(key_to_string): Json<BTreeMap<String, String>>,
) -> Result<Json<BatchReport>, AppError> {
    let report = state.coordinator.annotate(key_to_string).await?;
    Ok(Json(report))
}
