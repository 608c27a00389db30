//! # Copy Task Executor
//!
//! Runs one batch through the external copy tool on a preemptible worker.
//! The copy tool is idempotent, so a batch whose worker was preempted or whose
//! task failed is simply launched again, up to the configured attempt ceiling.
//! Malformed batches and rejected launches are never retried.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error_classifier::{malformed_batch_classification, ErrorClassifier};
use super::types::{AttemptRecord, BatchRecord, DispatchOutcome, LaunchError, TaskCompletion};
use crate::config::{CapacityProvider, ExecutionConfig, RunConfiguration, WorkerLaunchConfig};
use crate::constants::{events, DESTINATION_ENV_NAME};
use crate::models::{Batch, MalformedRow};

/// Everything the compute substrate needs to run one attempt of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub batch_index: u64,
    /// 1-based
    pub attempt: u32,
    pub program: String,
    pub container_name: String,
    /// Ordered source locators, passed as the tool's argument list
    pub command: Vec<String>,
    /// Static worker environment plus the destination parameter
    pub environment: BTreeMap<String, String>,
    pub capacity: CapacityProvider,
    pub cpu_units: u32,
    pub memory_mib: u32,
    pub stop_timeout: Duration,
    pub platform_version: String,
    pub tags: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Build the request for one attempt, failing on the first malformed row
    pub fn for_batch<'a>(
        batch: &'a Batch,
        attempt: u32,
        worker: &WorkerLaunchConfig,
        tags: &BTreeMap<String, String>,
    ) -> Result<Self, &'a MalformedRow> {
        let command = batch.source_locators()?;

        let mut environment = worker.environment.clone();
        environment.insert(
            DESTINATION_ENV_NAME.to_string(),
            batch.shared.destination_locator.clone(),
        );

        Ok(Self {
            batch_index: batch.index,
            attempt,
            program: worker.program.clone(),
            container_name: worker.container_name.clone(),
            command,
            environment,
            capacity: worker.capacity,
            cpu_units: worker.cpu_units,
            memory_mib: worker.memory_mib,
            stop_timeout: worker.stop_timeout(),
            platform_version: worker.platform_version.clone(),
            tags: if worker.propagate_tags {
                tags.clone()
            } else {
                BTreeMap::new()
            },
        })
    }
}

/// Compute substrate boundary: run one copy task to completion
#[async_trait]
pub trait CopyWorkerLauncher: Send + Sync {
    /// Launch the task and wait for it to stop
    ///
    /// Implementations should force-stop the task when `cancel` fires and may
    /// still report the task's real outcome if it cannot be stopped.
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion, LaunchError>;
}

pub struct CopyTaskExecutor {
    launcher: Arc<dyn CopyWorkerLauncher>,
    classifier: Arc<dyn ErrorClassifier>,
    worker: WorkerLaunchConfig,
    execution: ExecutionConfig,
    tags: BTreeMap<String, String>,
}

impl CopyTaskExecutor {
    pub fn new(
        launcher: Arc<dyn CopyWorkerLauncher>,
        classifier: Arc<dyn ErrorClassifier>,
        config: &RunConfiguration,
    ) -> Self {
        Self {
            launcher,
            classifier,
            worker: config.worker.clone(),
            execution: config.execution.clone(),
            tags: config.deployment.tags.clone(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.execution.max_retry_attempts_per_batch
    }

    /// Execute a batch, retrying retryable failures, and return its final record
    #[instrument(skip(self, batch, cancel), fields(batch_index = batch.index, items = batch.len()))]
    pub async fn execute(&self, batch: &Batch, cancel: &CancellationToken) -> BatchRecord {
        let dispatched_at = Utc::now();
        let max_attempts = self.max_attempts();
        let mut attempts = Vec::new();
        let mut outcome = DispatchOutcome::FailedRetryable(0);

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();

            let request = match LaunchRequest::for_batch(batch, attempt, &self.worker, &self.tags) {
                Ok(request) => request,
                Err(row) => {
                    let classification = malformed_batch_classification(format!(
                        "line {}: {} ({})",
                        row.line_number, row.raw, row.reason
                    ));
                    warn!(
                        event = events::BATCH_FAILED,
                        error_code = %classification.error_code,
                        error = %classification.error_message,
                        "❌ EXECUTOR: Batch cannot be launched"
                    );
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                        completion: None,
                        error: Some(classification.error_message),
                    });
                    outcome = DispatchOutcome::FailedTerminal;
                    break;
                }
            };

            debug!(attempt, capacity = %request.capacity, "🚀 EXECUTOR: Launching copy task");

            match self.launcher.launch(&request, cancel).await {
                Ok(completion) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                        completion: Some(completion),
                        error: None,
                    });
                    outcome = DispatchOutcome::Succeeded;
                    break;
                }
                Err(error) => {
                    let classification =
                        self.classifier
                            .classify_task_failure(&error, attempt, max_attempts);
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                        completion: error.completion().cloned(),
                        error: Some(error.to_string()),
                    });

                    if !classification.is_retryable || cancel.is_cancelled() {
                        outcome = DispatchOutcome::FailedTerminal;
                        break;
                    }

                    outcome = DispatchOutcome::FailedRetryable(attempt);
                    let delay = self.execution.retry_delay(attempt);
                    info!(
                        event = events::BATCH_RETRYING,
                        attempt,
                        category = %classification.error_category,
                        delay_ms = delay.as_millis() as u64,
                        error = %classification.error_message,
                        "🔁 EXECUTOR: Retrying batch"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            outcome = DispatchOutcome::FailedTerminal;
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        // A retryable failure on the final attempt is terminal
        if !outcome.is_final() {
            outcome = DispatchOutcome::FailedTerminal;
        }

        BatchRecord {
            index: batch.index,
            item_count: batch.len(),
            outcome,
            attempts,
            dispatched_at,
            finished_at: Utc::now(),
            after_cancel: cancel.is_cancelled(),
        }
    }
}

/// Local substrate: runs the copy tool as a child process
///
/// Exit status zero is success, a non-zero exit code is a task failure, and
/// termination by signal is treated as preemption.
#[derive(Debug, Clone, Default)]
pub struct ProcessCopyWorker;

impl ProcessCopyWorker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CopyWorkerLauncher for ProcessCopyWorker {
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion, LaunchError> {
        let mut child = tokio::process::Command::new(&request.program)
            .args(&request.command)
            .envs(&request.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::LaunchRejected {
                reason: format!("failed to start '{}': {e}", request.program),
            })?;

        let capacity_provider_name = Some(request.capacity.to_string());

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                debug!(batch_index = request.batch_index, "🛑 WORKER: Stopping copy task");
                let _ = child.start_kill();
                // The task may still finish on its own within the stop timeout
                let _ = tokio::time::timeout(request.stop_timeout, child.wait()).await;
                return Err(LaunchError::Cancelled);
            }
        };

        let status = status.map_err(|e| LaunchError::TaskFailed {
            exit_code: None,
            reason: format!("failed to wait for copy task: {e}"),
            completion: TaskCompletion {
                capacity_provider_name: capacity_provider_name.clone(),
                stopped_at: Some(Utc::now()),
                ..TaskCompletion::default()
            },
        })?;

        let completion = TaskCompletion {
            exit_code: status.code(),
            capacity_provider_name,
            stopped_reason: Some(status.to_string()),
            stopped_at: Some(Utc::now()),
        };

        match status.code() {
            Some(0) => Ok(completion),
            Some(code) => Err(LaunchError::TaskFailed {
                exit_code: Some(code),
                reason: format!("copy task exited with code {code}"),
                completion,
            }),
            None => Err(LaunchError::Preempted {
                reason: format!("copy task terminated: {status}"),
                completion,
            }),
        }
    }
}
