//! Reading and writing decoder input/output files inside a workspace

use std::io::ErrorKind;
use std::path::Path;

use matie_core::{MatieError, Result};

use crate::workspace::{DocumentSlot, Workspace};

/// Replace line breaks with spaces
///
/// The decoder treats every line as a separate sentence, so documents are
/// flattened to a single line before they are written.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Write the normalized text of one document and return it
pub async fn write_input(workspace: &Workspace, slot: &DocumentSlot, text: &str) -> Result<String> {
    let normalized = normalize_text(text);
    let path = workspace.input_path(slot);

    tokio::fs::write(&path, normalized.as_bytes())
        .await
        .map_err(|source| MatieError::Io { path, source })?;

    Ok(normalized)
}

/// Read back the input text of one document
pub async fn read_text(workspace: &Workspace, slot: &DocumentSlot) -> Result<String> {
    read_output(&slot.key, &workspace.input_path(slot)).await
}

/// Read the raw `.ann` content the decoder produced for one document
pub async fn read_annotation(workspace: &Workspace, slot: &DocumentSlot) -> Result<String> {
    read_output(&slot.key, &workspace.annotation_path(slot)).await
}

async fn read_output(key: &str, path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(MatieError::MissingOutput {
            key: key.to_string(),
            path: path.to_path_buf(),
        }),
        Err(source) => Err(MatieError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
