//! MatIE API Server
//!
//! REST API server for batch entity and relation annotation.
//!
//! Author: hephaex@gmail.com

use matie_api::{create_router, state::AppState};
use matie_core::config::{AppConfig, LoggingConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(
        decode_script = %config.annotator.decode_script.display(),
        working_dir = %config.annotator.working_dir.display(),
        "Annotator configured"
    );

    let state = Arc::new(AppState::new(config));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("MatIE API Server starting on http://{}", addr);
    tracing::info!("OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Config file from `MATIE_CONFIG` (if set), then environment overrides
fn load_config() -> anyhow::Result<AppConfig> {
    let config = match std::env::var("MATIE_CONFIG") {
        Ok(path) => AppConfig::from_file(path)?.with_env_override()?,
        Err(_) => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("matie_api={0},matie_runner={0},tower_http=info", logging.level).into()
    });

    if logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
