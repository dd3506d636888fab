//! Service Configuration Management
//!
//! Handles configuration from environment variables and TOML config files
//! with defaults matching the layout of a MatIE checkout.
//!
//! Author: hephaex@gmail.com

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// External annotator configuration
    pub annotator: AnnotatorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Server
        if let Ok(host) = std::env::var("API_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env("API_PORT")? {
            self.server.port = port;
        }

        // Annotator
        if let Ok(script) = std::env::var("MATIE_DECODE_SCRIPT") {
            self.annotator.decode_script = PathBuf::from(script);
        }
        if let Ok(dir) = std::env::var("MATIE_TOOL_DIR") {
            self.annotator.tool_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("MATIE_MODEL_DIR") {
            self.annotator.model_dir = dir;
        }
        if let Ok(dir) = std::env::var("MATIE_VOCAB_DIR") {
            self.annotator.vocab_dir = dir;
        }
        if let Ok(args) = std::env::var("MATIE_EXTRA_ARGS") {
            self.annotator.extra_args = args;
        }
        if let Some(disable) = parse_env("MATIE_DISABLE_GPU")? {
            self.annotator.disable_gpu = disable;
        }
        if let Ok(dir) = std::env::var("MATIE_WORKING_DIR") {
            self.annotator.working_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_env("MATIE_TIMEOUT_SECS")? {
            self.annotator.timeout_secs = secs;
        }
        if let Some(max) = parse_env("MATIE_MAX_DOCS_PER_UNIT")? {
            self.annotator.max_documents_per_unit = max;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_env("LOG_JSON")? {
            self.logging.json_format = json;
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// External annotator (MatIE decoder) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    /// Decoder entry point, relative to `tool_dir` unless absolute
    pub decode_script: PathBuf,

    /// Working directory the decoder is started in
    pub tool_dir: PathBuf,

    /// Trained NER model directory (`MODEL_DIR`)
    pub model_dir: String,

    /// Vocabulary pack directory (`VOCAB_DIR`)
    pub vocab_dir: String,

    /// Passed through as `EXTRA_ARGS`
    pub extra_args: String,

    /// Hide all GPUs from the decoder
    pub disable_gpu: bool,

    /// Base directory under which per-batch workspaces are created
    pub working_dir: PathBuf,

    /// Subdirectories whose name contains this marker are never processed
    pub exclusion_marker: String,

    /// Deadline for one decoder invocation in seconds (0 = none)
    pub timeout_secs: u64,

    /// Documents per unit directory (0 = a single unit per batch)
    pub max_documents_per_unit: usize,

    /// Bytes of stdout/stderr kept per invocation
    pub max_captured_output: usize,
}

impl AnnotatorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            decode_script: PathBuf::from("./decode.sh"),
            tool_dir: PathBuf::from("."),
            model_dir: "model".to_string(),
            vocab_dir: "vpack_mat".to_string(),
            extra_args: String::new(),
            disable_gpu: true,
            working_dir: PathBuf::from("matie_annotation"),
            exclusion_marker: "_original".to_string(),
            timeout_secs: 0,
            max_documents_per_unit: 0,
            max_captured_output: 64 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
