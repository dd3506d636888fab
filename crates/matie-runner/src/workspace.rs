//! Per-batch workspace management
//!
//! Every batch gets its own uniquely named directory under the shared base
//! directory. The decoder is only ever pointed at that directory, so two
//! batches carrying the same document key never see each other's files.
//!
//! Layout:
//!
//! ```text
//! <base>/matie_file_annotation_XXXXXX/   workspace root (one per batch)
//!     unit_000/                          one decoder invocation
//!         <safe_key>.txt
//!         <safe_key>.ann                 written by the decoder
//!     unit_001/
//!         ...
//! ```
//!
//! Author: hephaex@gmail.com

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use matie_core::{MatieError, Result};

/// Name prefix of every workspace directory
pub const WORKSPACE_PREFIX: &str = "matie_file_annotation_";

/// Extension of decoder input files
pub const INPUT_EXTENSION: &str = "txt";

/// Extension of decoder output files
pub const ANNOTATION_EXTENSION: &str = "ann";

// ============================================================================
// Key mapping
// ============================================================================

/// Map a caller key to a file stem that is safe inside a unit directory
///
/// Path separators and NUL are replaced with `_`. The mapping is not
/// injective (`a/b` and `a_b` collide); [`BatchLayout::plan`] rejects such
/// batches.
pub fn safe_file_stem(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(MatieError::InvalidKey("document key is empty".to_string()));
    }

    Ok(key
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect())
}

/// Where one document lives inside a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSlot {
    /// Caller key
    pub key: String,
    /// Unit directory name
    pub unit: String,
    /// Safe file stem
    pub stem: String,
}

/// Assignment of every key of a batch to a unit directory and file stem
#[derive(Debug, Clone, Default)]
pub struct BatchLayout {
    slots: Vec<DocumentSlot>,
    units: Vec<String>,
}

impl BatchLayout {
    /// Validate keys and assign them to units
    ///
    /// `max_per_unit == 0` puts every document into a single unit.
    pub fn plan<'a>(keys: impl IntoIterator<Item = &'a str>, max_per_unit: usize) -> Result<Self> {
        let mut seen: HashMap<String, &'a str> = HashMap::new();
        let mut layout = Self::default();

        for (index, key) in keys.into_iter().enumerate() {
            let stem = safe_file_stem(key)?;
            if let Some(first) = seen.insert(stem.clone(), key) {
                return Err(MatieError::KeyCollision {
                    first: first.to_string(),
                    second: key.to_string(),
                    file_name: format!("{stem}.{INPUT_EXTENSION}"),
                });
            }

            let unit_index = if max_per_unit == 0 {
                0
            } else {
                index / max_per_unit
            };
            let unit = unit_name(unit_index);
            if layout.units.last() != Some(&unit) {
                layout.units.push(unit.clone());
            }

            layout.slots.push(DocumentSlot {
                key: key.to_string(),
                unit,
                stem,
            });
        }

        Ok(layout)
    }

    pub fn slots(&self) -> &[DocumentSlot] {
        &self.slots
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn unit_name(index: usize) -> String {
    format!("unit_{index:03}")
}

// ============================================================================
// Workspace
// ============================================================================

/// Allocates workspaces under a shared base directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a fresh, uniquely named workspace
    pub async fn allocate(&self) -> Result<Workspace> {
        let base_dir = self.base_dir.clone();
        let created = tokio::task::spawn_blocking(move || allocate_in(&base_dir))
            .await
            .map_err(|e| MatieError::WorkspaceCreation {
                path: self.base_dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })??;

        tracing::debug!(workspace = %created.root().display(), "Allocated workspace");
        Ok(created)
    }
}

fn allocate_in(base_dir: &Path) -> Result<Workspace> {
    let creation_error = |source| MatieError::WorkspaceCreation {
        path: base_dir.to_path_buf(),
        source,
    };

    let base_dir = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        std::env::current_dir().map_err(creation_error)?.join(base_dir)
    };

    std::fs::create_dir_all(&base_dir).map_err(creation_error)?;

    let dir = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir_in(&base_dir)
        .map_err(creation_error)?;

    Ok(Workspace { dir })
}

/// An isolated directory owned by exactly one batch
///
/// Dropping the workspace deletes it, so every exit path of a batch
/// (including errors and cancellation) cleans up. Call [`Workspace::release`]
/// to observe deletion failures.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Absolute path of the workspace root
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn unit_dir(&self, unit: &str) -> PathBuf {
        self.root().join(unit)
    }

    pub fn input_path(&self, slot: &DocumentSlot) -> PathBuf {
        self.unit_dir(&slot.unit)
            .join(format!("{}.{INPUT_EXTENSION}", slot.stem))
    }

    pub fn annotation_path(&self, slot: &DocumentSlot) -> PathBuf {
        self.unit_dir(&slot.unit)
            .join(format!("{}.{ANNOTATION_EXTENSION}", slot.stem))
    }

    /// Create the unit directories of a layout
    pub async fn create_units(&self, layout: &BatchLayout) -> Result<()> {
        for unit in layout.units() {
            let path = self.unit_dir(unit);
            tokio::fs::create_dir(&path)
                .await
                .map_err(|source| MatieError::WorkspaceCreation { path, source })?;
        }
        Ok(())
    }

    /// Recursively delete the workspace
    pub async fn release(self) -> Result<()> {
        let path = self.root().to_path_buf();
        let result = tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|closed| closed);

        match result {
            Ok(()) => {
                tracing::debug!(workspace = %path.display(), "Released workspace");
                Ok(())
            }
            Err(source) => Err(MatieError::Io { path, source }),
        }
    }
}
