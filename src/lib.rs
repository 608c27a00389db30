#![allow(clippy::doc_markdown)] // Allow technical terms like FARGATE_SPOT in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Copy-Out Core
//!
//! Orchestration core for bulk copy-out of objects onto ephemeral, preemptible
//! copy workers.
//!
//! ## Overview
//!
//! A run copies every object listed in a manifest to one destination store.
//! Before committing to the bulk operation it proves the destination is
//! writable from the required region, then partitions the manifest into
//! batches and runs each batch through an external, idempotent copy tool with
//! bounded concurrency. Individual batches may fail; the run succeeds when the
//! failed share stays within the configured tolerance.
//!
//! ## Workflow
//!
//! ```text
//! WorkflowController ─▶ WriteCapabilityProber (loop until writable or terminal)
//!                   ─▶ ManifestBatcher ─▶ CopyDispatcher ─▶ N × CopyTaskExecutor
//!                   ─▶ Succeeded | Failed(kind)
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Per-deployment run configuration and layered loading
//! - [`models`] - Execution input, manifest rows and batches
//! - [`state_machine`] - Run lifecycle states, events and transitions
//! - [`orchestration`] - Prober, batcher, dispatcher, executor and controller
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured console logging
//! - [`testing`] - In-process doubles for the external boundaries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use copy_out_core::config::{Posture, RunConfiguration};
//! use copy_out_core::models::ExecutionInput;
//! use copy_out_core::orchestration::{
//!     LocalManifestSource, ProcessCopyWorker, WorkflowController,
//! };
//! use copy_out_core::testing::ScriptedObjectWriter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! copy_out_core::logging::init_structured_logging();
//!
//! let config = RunConfiguration::for_posture(Posture::FastIteration, "ap-southeast-2");
//! let controller = WorkflowController::new(
//!     Arc::new(config),
//!     Arc::new(ScriptedObjectWriter::new()),
//!     Arc::new(LocalManifestSource::new("/srv/manifests")),
//!     Arc::new(ProcessCopyWorker::new()),
//! )?;
//!
//! let input = ExecutionInput::from_json(
//!     r#"{"sourceFilesCsvBucket":"manifests","sourceFilesCsvKey":"run.csv",
//!         "destinationBucket":"target"}"#,
//! )?;
//! let run_id = controller.start(input);
//! let status = controller.wait(run_id).await?;
//! println!("run finished in state {}", status.state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod testing;

pub use config::{ConfigManager, Posture, RunConfiguration};
pub use error::{CopyOutError, Result, RunErrorKind};
pub use models::{Batch, ExecutionInput, ManifestEntry, ManifestLocation};
pub use orchestration::{RunId, RunStatus, WorkflowController};
pub use state_machine::{RunEvent, RunState};
