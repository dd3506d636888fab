//! MatIE Runner - Batch orchestration around the external decoder
//!
//! Components, leaves first:
//! - [`workspace`]: per-batch directories and key-to-file mapping
//! - [`documents`]: writing inputs and reading decoder outputs
//! - [`orchestrator`]: running the decoder subprocess per unit directory
//! - [`batch`]: the end-to-end flow for one request
//!
//! Isolation between concurrent batches comes from giving each batch its own
//! workspace root; no in-memory state is shared between batches.
//!
//! Author: hephaex@gmail.com

pub mod batch;
pub mod documents;
pub mod metrics;
pub mod orchestrator;
pub mod workspace;

pub use batch::BatchCoordinator;
pub use orchestrator::{DecodeScript, Orchestrator, ToolEnvironment, UnitAnnotator};
pub use workspace::{BatchLayout, DocumentSlot, Workspace, WorkspaceManager};
