//! Batch coordination
//!
//! One call to [`BatchCoordinator::annotate`] handles one caller request:
//! validate keys, allocate a workspace, write inputs, run the decoder, read
//! and parse outputs, release the workspace.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use matie_core::{AnnotatorConfig, BatchReport, DocumentOutcome, MatieError, Result};

use crate::documents;
use crate::metrics;
use crate::orchestrator::{Orchestrator, ToolEnvironment, UnitAnnotator};
use crate::workspace::{BatchLayout, DocumentSlot, Workspace, WorkspaceManager};

/// Drives one annotation batch end to end
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    workspaces: WorkspaceManager,
    orchestrator: Orchestrator,
    max_documents_per_unit: usize,
}

impl BatchCoordinator {
    pub fn new(
        workspaces: WorkspaceManager,
        orchestrator: Orchestrator,
        max_documents_per_unit: usize,
    ) -> Self {
        Self {
            workspaces,
            orchestrator,
            max_documents_per_unit,
        }
    }

    /// Coordinator running the configured decoder script
    pub fn from_config(config: &AnnotatorConfig) -> Self {
        Self::new(
            WorkspaceManager::new(&config.working_dir),
            Orchestrator::from_environment(ToolEnvironment::from(config)),
            config.max_documents_per_unit,
        )
    }

    /// Coordinator with a custom annotator (e.g. an in-process fake)
    pub fn with_annotator(config: &AnnotatorConfig, annotator: Arc<dyn UnitAnnotator>) -> Self {
        Self::new(
            WorkspaceManager::new(&config.working_dir),
            Orchestrator::new(annotator, config.exclusion_marker.clone()),
            config.max_documents_per_unit,
        )
    }

    /// Annotate a batch of documents
    ///
    /// Only invalid keys and workspace allocation failures are returned as
    /// errors. Everything else is reported per key in the returned report.
    pub async fn annotate(&self, inputs: BTreeMap<String, String>) -> Result<BatchReport> {
        let batch_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", %batch_id, documents = inputs.len());

        async move {
            let result = self.run(batch_id, &inputs).await;
            let label = match &result {
                Ok(_) => "completed",
                Err(MatieError::WorkspaceCreation { .. }) => "workspace_error",
                Err(_) => "rejected",
            };
            metrics::BATCHES_TOTAL.with_label_values(&[label]).inc();
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, batch_id: Uuid, inputs: &BTreeMap<String, String>) -> Result<BatchReport> {
        let layout =
            BatchLayout::plan(inputs.keys().map(String::as_str), self.max_documents_per_unit)?;
        let mut report = BatchReport::new(batch_id);
        if layout.is_empty() {
            return Ok(report);
        }

        tracing::info!(units = layout.units().len(), "Creating temporary input files");
        let workspace = self.workspaces.allocate().await?;
        workspace.create_units(&layout).await?;

        let mut written: Vec<&DocumentSlot> = Vec::with_capacity(layout.slots().len());
        for slot in layout.slots() {
            let text = inputs.get(&slot.key).map(String::as_str).unwrap_or_default();
            match documents::write_input(&workspace, slot, text).await {
                Ok(_) => written.push(slot),
                Err(e) => {
                    tracing::warn!(key = %slot.key, "Failed to write input: {}", e);
                    report.documents.insert(slot.key.clone(), DocumentOutcome::failed(&e));
                }
            }
        }

        if !written.is_empty() {
            tracing::info!("Annotating temp files");
            match self.orchestrator.run_workspace(workspace.root()).await {
                Ok(runs) => report.tool_runs = runs,
                Err(e) => tracing::error!("Failed to scan workspace for units: {}", e),
            }
        }

        tracing::info!("Formatting annotated files");
        for slot in written {
            let outcome = collect_outcome(&workspace, slot).await;
            if let DocumentOutcome::Failed { message, .. } = &outcome {
                tracing::warn!(key = %slot.key, "No annotations: {}", message);
            }
            report.documents.insert(slot.key.clone(), outcome);
        }

        for outcome in report.documents.values() {
            metrics::DOCUMENTS_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();
        }

        if let Err(e) = workspace.release().await {
            tracing::error!("Failed to release workspace: {}", e);
        }

        tracing::info!(
            annotated = report.annotated_count(),
            tool_failures = report.has_tool_failures(),
            "Batch finished"
        );
        Ok(report)
    }
}

/// Read text and annotations for one key and turn them into an outcome
async fn collect_outcome(workspace: &Workspace, slot: &DocumentSlot) -> DocumentOutcome {
    let result = async {
        let raw = documents::read_annotation(workspace, slot).await?;
        let text = documents::read_text(workspace, slot).await?;
        let annotations = matie_standoff::parse_annotations(&raw)?;
        let warnings = matie_standoff::dangling_references(&annotations)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        Ok::<_, MatieError>(DocumentOutcome::annotated(text, annotations, warnings))
    }
    .await;

    match result {
        Ok(outcome) => {
            if let DocumentOutcome::Annotated { warnings, .. } = &outcome {
                for warning in warnings {
                    tracing::warn!(key = %slot.key, "{}", warning);
                }
            }
            outcome
        }
        Err(e) => DocumentOutcome::failed(&e),
    }
}
