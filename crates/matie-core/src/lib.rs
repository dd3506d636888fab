//! MatIE Core - Domain models, errors and shared types
//!
//! This crate defines the core abstractions used throughout the service:
//! - Standoff annotation models (entities, relations)
//! - Per-document and per-batch result types
//! - Common error types
//! - Configuration management
//!
//! Author: hephaex@gmail.com

pub mod config;

pub use config::{AnnotatorConfig, AppConfig, ConfigError, LoggingConfig, ServerConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for annotation batches
#[derive(Error, Debug)]
pub enum MatieError {
    #[error("Failed to create workspace at {path}: {source}")]
    WorkspaceCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    #[error("Document keys {first:?} and {second:?} both map to file name {file_name:?}")]
    KeyCollision {
        first: String,
        second: String,
        file_name: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No output produced for key {key:?} (expected {path})")]
    MissingOutput { key: String, path: PathBuf },

    #[error("Malformed annotation on line {line}: {reason}")]
    MalformedAnnotation { line: usize, reason: String },

    #[error("External process error in {unit}: {message}")]
    ExternalProcess { unit: String, message: String },
}

impl MatieError {
    /// Stable snake_case identifier reported to callers
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkspaceCreation { .. } => "workspace_creation",
            Self::InvalidKey(_) => "invalid_key",
            Self::KeyCollision { .. } => "key_collision",
            Self::Io { .. } => "io",
            Self::MissingOutput { .. } => "missing_output",
            Self::MalformedAnnotation { .. } => "malformed_annotation",
            Self::ExternalProcess { .. } => "external_process",
        }
    }

    /// Whether the error aborts the whole batch rather than a single document
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            Self::WorkspaceCreation { .. } | Self::InvalidKey(_) | Self::KeyCollision { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MatieError>;

// ============================================================================
// Standoff Annotation Models
// ============================================================================

/// Entity span reported by the external tool (`T` line)
///
/// Offsets are copied verbatim from the annotation file and are never
/// recomputed against the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Entity {
    /// Identifier, e.g. `T1`
    pub id: String,
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    /// Literal text as written in the annotation file
    pub entity_string: String,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{} {} {}\t{}",
            self.id, self.entity_type, self.start, self.end, self.entity_string
        )
    }
}

/// Binary relation between two entities (`R` line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Relation {
    /// Identifier, e.g. `R1`
    pub id: String,
    pub relation_type: String,
    pub arg1: String,
    pub arg2: String,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{} Arg1:{} Arg2:{}",
            self.id, self.relation_type, self.arg1, self.arg2
        )
    }
}

/// Parsed content of one `.ann` file, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl Annotations {
    /// Render back to standoff lines (entities first, then relations)
    pub fn to_standoff(&self) -> String {
        let mut out = String::new();
        for entity in &self.entities {
            out.push_str(&entity.to_string());
            out.push('\n');
        }
        for relation in &self.relations {
            out.push_str(&relation.to_string());
            out.push('\n');
        }
        out
    }
}

// ============================================================================
// Batch Results
// ============================================================================

/// Outcome for a single document key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    /// Annotation file was produced and parsed
    Annotated {
        /// Normalized text that was handed to the tool
        text: String,
        entities: Vec<Entity>,
        relations: Vec<Relation>,
        /// Integrity problems found in the tool output (e.g. dangling relation arguments)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    /// No result for this key
    Failed {
        /// Error kind, see [`MatieError::kind`]
        kind: String,
        message: String,
    },
}

impl DocumentOutcome {
    pub fn annotated(text: String, annotations: Annotations, warnings: Vec<String>) -> Self {
        Self::Annotated {
            text,
            entities: annotations.entities,
            relations: annotations.relations,
            warnings,
        }
    }

    pub fn failed(err: &MatieError) -> Self {
        Self::Failed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_annotated(&self) -> bool {
        matches!(self, Self::Annotated { .. })
    }

    /// Label used for logging and metrics
    pub fn label(&self) -> &str {
        match self {
            Self::Annotated { .. } => "annotated",
            Self::Failed { kind, .. } => kind,
        }
    }
}

/// Final state of one external tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolRunStatus {
    Succeeded,
    /// Process exited with a non-zero status or was killed by a signal
    Failed,
    TimedOut,
    /// Process could not be started (missing script, permissions)
    SpawnFailed,
}

impl ToolRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::SpawnFailed => "spawn_failed",
        }
    }
}

impl std::fmt::Display for ToolRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of one external tool invocation against a unit directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ToolRun {
    /// Unit directory name inside the workspace
    pub unit: String,
    pub status: ToolRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured stdout (truncated)
    pub stdout: String,
    /// Captured stderr (truncated)
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolRun {
    pub fn succeeded(&self) -> bool {
        self.status == ToolRunStatus::Succeeded
    }

    /// The recorded failure, if the invocation did not succeed
    pub fn failure(&self) -> Option<MatieError> {
        if self.succeeded() {
            return None;
        }
        Some(MatieError::ExternalProcess {
            unit: self.unit.clone(),
            message: self
                .error
                .clone()
                .unwrap_or_else(|| self.status.to_string()),
        })
    }
}

/// Result of one annotation batch
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// Outcome per caller key
    pub documents: BTreeMap<String, DocumentOutcome>,
    /// External invocations, in execution order
    pub tool_runs: Vec<ToolRun>,
}

impl BatchReport {
    pub fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            documents: BTreeMap::new(),
            tool_runs: Vec::new(),
        }
    }

    /// Number of keys that were annotated successfully
    pub fn annotated_count(&self) -> usize {
        self.documents.values().filter(|o| o.is_annotated()).count()
    }

    /// True if any tool invocation did not succeed
    pub fn has_tool_failures(&self) -> bool {
        self.tool_runs.iter().any(|run| !run.succeeded())
    }
}

// ============================================================================
// Tests
// ============================================================================
