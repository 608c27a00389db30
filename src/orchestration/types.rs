//! # Orchestration Types
//!
//! Results and records shared across the prober, dispatcher, executor and
//! controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structured failure from an object-storage put
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", .code.as_deref().unwrap_or("NoCode"))]
pub struct StorageError {
    /// Provider error code, e.g. `PermanentRedirect` or `AccessDenied`
    pub code: Option<String>,
    pub message: String,
}

impl StorageError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn without_code(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// Outcome of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ProbeResult {
    Writable,
    /// Terminal: the destination lives in another region
    WrongRegion(String),
    /// Retryable: permission may be granted later
    AccessDenied(String),
    /// Fatal, propagated as-is
    OtherFailure(String),
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writable => write!(f, "writable"),
            Self::WrongRegion(_) => write!(f, "wrong_region"),
            Self::AccessDenied(_) => write!(f, "access_denied"),
            Self::OtherFailure(_) => write!(f, "other_failure"),
        }
    }
}

/// Record of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    /// 1-based
    pub attempt: u32,
    pub result: ProbeResult,
    pub at: DateTime<Utc>,
}

/// What the compute substrate reports when a worker task stops
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub exit_code: Option<i32>,
    pub capacity_provider_name: Option<String>,
    pub stopped_reason: Option<String>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// A worker task that did not finish successfully
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LaunchError {
    /// The substrate reclaimed the worker
    #[error("Worker preempted: {reason}")]
    Preempted {
        reason: String,
        completion: TaskCompletion,
    },

    /// The task ran and stopped unsuccessfully
    #[error("Task failed with exit code {exit_code:?}: {reason}")]
    TaskFailed {
        exit_code: Option<i32>,
        reason: String,
        completion: TaskCompletion,
    },

    /// The substrate refused to start the task
    #[error("Launch rejected: {reason}")]
    LaunchRejected { reason: String },

    /// The task was stopped because the run was cancelled
    #[error("Task stopped by cancellation")]
    Cancelled,
}

impl LaunchError {
    pub fn completion(&self) -> Option<&TaskCompletion> {
        match self {
            Self::Preempted { completion, .. } | Self::TaskFailed { completion, .. } => {
                Some(completion)
            }
            _ => None,
        }
    }
}

/// Per-batch execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "attempts", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Succeeded,
    /// Failed so far and waiting for another attempt
    FailedRetryable(u32),
    FailedTerminal,
}

impl DispatchOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::FailedRetryable(_))
    }
}

/// Record of one executor attempt against one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completion: Option<TaskCompletion>,
    /// `None` when the attempt succeeded
    pub error: Option<String>,
}

/// Everything known about one batch once it is final
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub index: u64,
    pub item_count: usize,
    pub outcome: DispatchOutcome,
    pub attempts: Vec<AttemptRecord>,
    pub dispatched_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Result arrived after the run was cancelled or timed out
    pub after_cancel: bool,
}

/// A batch that ended `FailedTerminal`, kept for manual re-submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub index: u64,
    pub source_locators: Vec<String>,
    pub error: Option<String>,
}

/// Aggregate result of dispatching a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub dispatched_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub tolerated_failure_percentage: f64,
    pub cancelled: bool,
    pub failed_batches: Vec<FailedBatch>,
}

impl DispatchSummary {
    /// Share of dispatched batches that failed, 0-100
    pub fn failure_percentage(&self) -> f64 {
        if self.dispatched_count == 0 {
            return 0.0;
        }
        self.failed_count as f64 * 100.0 / self.dispatched_count as f64
    }

    /// True when the failed share is within tolerance
    pub fn within_tolerance(&self) -> bool {
        self.failed_count as f64 * 100.0
            <= self.tolerated_failure_percentage * self.dispatched_count as f64
    }
}
