//! # Failure Classification
//!
//! Maps raw failures from the two external boundaries onto the small set of
//! kinds the workflow acts on. Classification is pure: it never sleeps, retries
//! or logs. Retry policy lives with the caller (the prober for writes, the
//! copy task executor for worker tasks).
//!
//! ```text
//! ┌──────────────────┐     ┌─────────────────┐     ┌───────────────────┐
//! │ StorageError     │────▶│                 │────▶│ WriteFailureKind  │
//! └──────────────────┘     │ ErrorClassifier │     └───────────────────┘
//! ┌──────────────────┐     │                 │     ┌───────────────────┐
//! │ LaunchError      │────▶│                 │────▶│ ErrorClassification│
//! └──────────────────┘     └─────────────────┘     └───────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{LaunchError, StorageError};
use crate::constants::{PROVIDER_CODE_ACCESS_DENIED, PROVIDER_CODE_PERMANENT_REDIRECT};

/// Semantic kind of a failed destination write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailureKind {
    WrongRegion,
    AccessDenied,
    Unclassified,
}

/// Primary categories for worker task failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The worker was reclaimed by the substrate
    WorkerPreemption,
    /// The task ran and failed; the copy is idempotent so it may be re-run
    TaskFailed,
    /// The batch itself cannot be executed
    MalformedBatch,
    /// The substrate refused the launch request
    LaunchRejected,
    /// Stopped on purpose
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerPreemption => write!(f, "Worker Preemption"),
            Self::TaskFailed => write!(f, "Task Failed"),
            Self::MalformedBatch => write!(f, "Malformed Batch"),
            Self::LaunchRejected => write!(f, "Launch Rejected"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Result of classifying a task failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_category: ErrorCategory,

    /// Whether the batch should be attempted again
    pub is_retryable: bool,

    /// Stable code for logs and status
    pub error_code: String,

    pub error_message: String,

    /// Whether this was the last permitted attempt
    pub is_final_attempt: bool,
}

/// Trait for failure classification strategies
pub trait ErrorClassifier: Send + Sync {
    /// Classify a failed marker write
    fn classify_write_failure(&self, error: &StorageError) -> WriteFailureKind;

    /// Classify a failed worker task given the attempt it failed on
    fn classify_task_failure(
        &self,
        error: &LaunchError,
        attempt_number: u32,
        max_attempts: u32,
    ) -> ErrorClassification;

    /// Get the classifier name for identification
    fn classifier_name(&self) -> &'static str;
}

/// Classifier keyed on provider error codes and substrate failure signals
#[derive(Debug, Clone, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_write_failure(&self, error: &StorageError) -> WriteFailureKind {
        match error.code.as_deref() {
            Some(PROVIDER_CODE_PERMANENT_REDIRECT) => WriteFailureKind::WrongRegion,
            Some(PROVIDER_CODE_ACCESS_DENIED) => WriteFailureKind::AccessDenied,
            _ => WriteFailureKind::Unclassified,
        }
    }

    fn classify_task_failure(
        &self,
        error: &LaunchError,
        attempt_number: u32,
        max_attempts: u32,
    ) -> ErrorClassification {
        let is_final_attempt = attempt_number >= max_attempts;

        let (category, retryable_kind, error_code) = match error {
            LaunchError::Preempted { .. } => {
                (ErrorCategory::WorkerPreemption, true, "WORKER_PREEMPTED")
            }
            LaunchError::TaskFailed { .. } => (ErrorCategory::TaskFailed, true, "TASK_FAILED"),
            LaunchError::LaunchRejected { .. } => {
                (ErrorCategory::LaunchRejected, false, "LAUNCH_REJECTED")
            }
            LaunchError::Cancelled => (ErrorCategory::Cancelled, false, "TASK_CANCELLED"),
        };

        ErrorClassification {
            error_category: category,
            is_retryable: retryable_kind && !is_final_attempt,
            error_code: error_code.to_string(),
            error_message: error.to_string(),
            is_final_attempt: is_final_attempt || !retryable_kind,
        }
    }

    fn classifier_name(&self) -> &'static str {
        "StandardErrorClassifier"
    }
}

/// Classification for a batch that cannot be turned into a launch request
pub fn malformed_batch_classification(message: impl Into<String>) -> ErrorClassification {
    ErrorClassification {
        error_category: ErrorCategory::MalformedBatch,
        is_retryable: false,
        error_code: "MALFORMED_BATCH".to_string(),
        error_message: message.into(),
        is_final_attempt: true,
    }
}
