//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use matie_core::MatieError;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL_ERROR", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Workspace(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::bad_request(msg)),
            AppError::Workspace(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::new("WORKSPACE_ERROR", "Could not allocate an isolated workspace")
                    .with_details(msg),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::internal_error().with_details(msg),
            ),
        };

        (status, Json(error)).into_response()
    }
}

impl From<MatieError> for AppError {
    fn from(err: MatieError) -> Self {
        match err {
            MatieError::InvalidKey(_) | MatieError::KeyCollision { .. } => {
                AppError::BadRequest(err.to_string())
            }
            MatieError::WorkspaceCreation { .. } => AppError::Workspace(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
