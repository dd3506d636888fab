//! MatIE CLI - Command-line interface
//!
//! Usage:
//!   matie annotate <files...> [--config FILE]
//!   matie parse <file.ann>
//!
//! Author: hephaex@gmail.com

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use matie_core::{AppConfig, LoggingConfig};
use matie_runner::BatchCoordinator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "matie")]
#[command(about = "Batch entity and relation annotation with the MatIE decoder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Annotate text files as one batch, keyed by file stem
    Annotate {
        /// Text files to annotate
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// TOML configuration file; environment variables still apply on top
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Parse a standoff annotation file and print it as JSON
    Parse {
        /// Path to the `.ann` file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Annotate { files, config } => {
            let config = match config {
                Some(path) => AppConfig::from_file(path)?.with_env_override()?,
                None => AppConfig::from_env()?,
            };
            init_tracing(&config.logging);
            annotate(&config, &files).await?;
        }
        Commands::Parse { file } => {
            let configured = AppConfig::from_env()
                .map(|c| c.logging)
                .unwrap_or_default();
            init_tracing(&parse_logging(configured));
            parse(&file).await?;
        }
    }

    Ok(())
}

/// `parse` keeps the configured log format but only reports warnings
fn parse_logging(configured: LoggingConfig) -> LoggingConfig {
    LoggingConfig {
        level: "warn".to_string(),
        ..configured
    }
}

/// Logs go to stderr so stdout stays valid JSON
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("matie_runner={0},matie={0}", logging.level).into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn annotate(config: &AppConfig, files: &[PathBuf]) -> anyhow::Result<()> {
    let texts = try_join_all(files.iter().map(|path| async move {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok::<_, anyhow::Error>((document_key(path)?, text))
    }))
    .await?;

    let mut inputs = BTreeMap::new();
    for (key, text) in texts {
        if inputs.insert(key.clone(), text).is_some() {
            bail!("more than one input file has the stem '{}'", key);
        }
    }

    let coordinator = BatchCoordinator::from_config(&config.annotator);
    let report = coordinator.annotate(inputs).await?;

    tracing::info!(
        batch_id = %report.batch_id,
        annotated = report.annotated_count(),
        total = report.documents.len(),
        "Batch finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn parse(file: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let annotations = matie_standoff::parse_annotations(&content)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    for dangling in matie_standoff::dangling_references(&annotations) {
        tracing::warn!("{}", dangling);
    }
    println!("{}", serde_json::to_string_pretty(&annotations)?);
    Ok(())
}

fn document_key(path: &Path) -> anyhow::Result<String> {
    match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!("cannot derive a document key from {}", path.display()),
    }
}
