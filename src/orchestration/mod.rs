//! # Orchestration Engine
//!
//! The copy-out workflow: one preflight probe, one bounded distributed map and
//! one terminal verdict per run.
//!
//! ## Core Components
//!
//! - **ErrorClassifier**: maps probe and worker failures onto the kinds the workflow acts on
//! - **WriteCapabilityProber**: marker write against the destination, waiting
//!   and retrying on denial
//! - **ManifestBatcher**: streams the manifest into ordered, bounded batches
//! - **CopyDispatcher**: runs batches with bounded concurrency and tolerated partial failure
//! - **CopyTaskExecutor**: one batch on one preemptible worker, retried on preemption
//! - **WorkflowController**: owns run state machines, the deadline and start/status/cancel
//!
//! The object store, manifest source and compute substrate are reached through
//! the [`ObjectWriter`], [`ManifestSource`] and [`CopyWorkerLauncher`] traits.

pub mod copy_task_executor;
pub mod dispatcher;
pub mod error_classifier;
pub mod manifest_batcher;
pub mod types;
pub mod workflow_controller;
pub mod write_prober;

pub use copy_task_executor::{
    CopyTaskExecutor, CopyWorkerLauncher, LaunchRequest, ProcessCopyWorker,
};
pub use dispatcher::{CopyDispatcher, DispatchProgress};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, StandardErrorClassifier,
    WriteFailureKind,
};
pub use manifest_batcher::{
    BatchStream, LocalManifestSource, ManifestBatcher, ManifestError, ManifestLines,
    ManifestSource,
};
pub use types::{
    AttemptRecord, BatchRecord, DispatchOutcome, DispatchSummary, FailedBatch, LaunchError,
    ProbeAttempt, ProbeResult, StorageError, TaskCompletion,
};
pub use workflow_controller::{RunError, RunId, RunStatus, WorkflowController};
pub use write_prober::{ObjectWriter, ProbeError, ProbeReport, WriteCapabilityProber};
