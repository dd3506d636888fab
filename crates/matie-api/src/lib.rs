//! MatIE API - HTTP server for batch annotation
//!
//! Exposes the batch coordinator over HTTP. Each request is handled on its
//! own task and gets its own workspace, so a slow decoder run never blocks
//! other batches.
//!
//! Author: hephaex@gmail.com

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::{extract::DefaultBodyLimit, middleware as axum_middleware, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use state::AppState;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::root,
        handlers::health::status,
        handlers::health::health_check,
        handlers::annotate::annotate_strings,
        handlers::annotate::annotate_batch,
    ),
    components(schemas(
        matie_core::Entity,
        matie_core::Relation,
        matie_core::DocumentOutcome,
        matie_core::ToolRun,
        matie_core::ToolRunStatus,
        matie_core::BatchReport,
        error::ApiError,
        handlers::health::HealthResponse,
    )),
    tags(
        (name = "health", description = "Liveness endpoints"),
        (name = "annotate", description = "Batch entity and relation annotation")
    )
)]
pub struct ApiDoc;

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.config.server.max_body_size;

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::annotate_routes())
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::metrics_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router with default configuration, for tests
pub fn create_router_for_testing() -> Router {
    create_router(Arc::new(AppState::default()))
}
