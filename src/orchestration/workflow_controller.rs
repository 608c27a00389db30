//! # Workflow Controller
//!
//! Owns every run's state machine and sequences the phases of a copy-out:
//!
//! ```text
//! Pending ─▶ Probing ─writable─▶ Dispatching ─within tolerance─▶ Succeeded
//!             │  ▲                 │
//!             └──┘ access denied   └─────────────────────────────▶ Failed(kind)
//! ```
//!
//! Each run executes on its own tokio task. The overall deadline is measured
//! from `start`; when it elapses, or when the run is cancelled, the terminal
//! `Failed` state is applied immediately and the run's cancellation token
//! fires. The run task then stops dispatching, drains in-flight executions and
//! records their late results without changing the terminal outcome.
//!
//! Runs stay queryable until they are removed with [`WorkflowController::forget`]
//! or [`WorkflowController::prune_finished`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::copy_task_executor::{CopyTaskExecutor, CopyWorkerLauncher};
use super::dispatcher::{CopyDispatcher, DispatchProgress};
use super::error_classifier::{ErrorClassifier, StandardErrorClassifier};
use super::manifest_batcher::{ManifestBatcher, ManifestSource};
use super::types::{BatchRecord, FailedBatch, ProbeAttempt, ProbeResult};
use super::write_prober::{ObjectWriter, ProbeError, WriteCapabilityProber};
use crate::config::RunConfiguration;
use crate::constants::events;
use crate::error::{CopyOutError, Result, RunErrorKind};
use crate::models::{ExecutionInput, SharedParameters};
use crate::state_machine::{
    RunEvent, RunState, RunStateMachine, StateMachineError, StateTransition,
};

pub type RunId = Uuid;

/// Terminal error reported by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub probe_attempts: Vec<ProbeAttempt>,
    pub probe_wait_cycles: u32,
    pub dispatched: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
    pub error: Option<RunError>,
    pub failed_batches: Vec<FailedBatch>,
    /// Every state change so far, oldest first
    pub transitions: Vec<StateTransition>,
}

#[derive(Debug, Default)]
struct ProbeProgress {
    attempts: Vec<ProbeAttempt>,
    wait_cycles: u32,
}

struct RunRecord {
    run_id: RunId,
    input: ExecutionInput,
    started_at: DateTime<Utc>,
    state_machine: Mutex<RunStateMachine>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    error: Mutex<Option<RunError>>,
    probe: Mutex<ProbeProgress>,
    progress: Arc<DispatchProgress>,
    cancel: CancellationToken,
    drained: watch::Sender<bool>,
}

impl RunRecord {
    fn new(run_id: RunId, input: ExecutionInput) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            run_id,
            input,
            started_at: Utc::now(),
            state_machine: Mutex::new(RunStateMachine::new(run_id)),
            finished_at: Mutex::new(None),
            error: Mutex::new(None),
            probe: Mutex::new(ProbeProgress::default()),
            progress: Arc::new(DispatchProgress::new()),
            cancel: CancellationToken::new(),
            drained,
        }
    }

    /// Apply a non-terminal event
    fn advance(&self, event: RunEvent) -> std::result::Result<RunState, StateMachineError> {
        self.state_machine.lock().transition(event)
    }

    /// Move to `Succeeded`; returns false when the run had already ended
    fn succeed(&self) -> bool {
        let mut sm = self.state_machine.lock();
        match sm.transition(RunEvent::Complete) {
            Ok(_) => {
                *self.finished_at.lock() = Some(Utc::now());
                info!(
                    event = events::RUN_SUCCEEDED,
                    run_id = %self.run_id,
                    "🎉 CONTROLLER: Run succeeded"
                );
                true
            }
            Err(e) => {
                debug!(run_id = %self.run_id, error = %e, "CONTROLLER: Completion ignored");
                false
            }
        }
    }

    /// Move to `Failed(kind)`; the first terminal transition wins
    fn fail(&self, kind: RunErrorKind, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut sm = self.state_machine.lock();
        match sm.transition(RunEvent::Fail(kind)) {
            Ok(_) => {
                *self.finished_at.lock() = Some(Utc::now());
                error!(
                    event = events::RUN_FAILED,
                    run_id = %self.run_id,
                    error_kind = %kind,
                    error = %message,
                    "❌ CONTROLLER: Run failed"
                );
                *self.error.lock() = Some(RunError { kind, message });
                true
            }
            Err(e) => {
                debug!(run_id = %self.run_id, error = %e, "CONTROLLER: Failure ignored");
                false
            }
        }
    }

    fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    fn snapshot(&self) -> RunStatus {
        let (state, transitions) = {
            let sm = self.state_machine.lock();
            (sm.current_state(), sm.history().to_vec())
        };
        let probe = self.probe.lock();
        RunStatus {
            run_id: self.run_id,
            state,
            started_at: self.started_at,
            finished_at: *self.finished_at.lock(),
            probe_attempts: probe.attempts.clone(),
            probe_wait_cycles: probe.wait_cycles,
            dispatched: self.progress.dispatched(),
            in_flight: self.progress.in_flight(),
            completed: self.progress.completed(),
            failed: self.progress.failed(),
            error: self.error.lock().clone(),
            failed_batches: self.progress.failed_batches(),
            transitions,
        }
    }
}

/// Components shared by every run of one controller
struct RunContext {
    config: Arc<RunConfiguration>,
    prober: WriteCapabilityProber,
    manifest_source: Arc<dyn ManifestSource>,
    dispatcher: CopyDispatcher,
}

/// Entry point for starting, observing and cancelling copy-out runs
pub struct WorkflowController {
    context: Arc<RunContext>,
    runs: Arc<DashMap<RunId, Arc<RunRecord>>>,
}

impl WorkflowController {
    /// Build a controller; fails when `config` does not validate
    pub fn new(
        config: Arc<RunConfiguration>,
        writer: Arc<dyn ObjectWriter>,
        manifest_source: Arc<dyn ManifestSource>,
        launcher: Arc<dyn CopyWorkerLauncher>,
    ) -> Result<Self> {
        Self::with_classifier(
            config,
            writer,
            manifest_source,
            launcher,
            Arc::new(StandardErrorClassifier::new()),
        )
    }

    pub fn with_classifier(
        config: Arc<RunConfiguration>,
        writer: Arc<dyn ObjectWriter>,
        manifest_source: Arc<dyn ManifestSource>,
        launcher: Arc<dyn CopyWorkerLauncher>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            error!(error = %e, "❌ CONTROLLER: Rejected run configuration");
            return Err(e.into());
        }

        info!(
            region = %config.deployment.region,
            posture = %config.deployment.posture,
            max_concurrency = config.dispatch.max_concurrency,
            classifier = classifier.classifier_name(),
            "🚀 CONTROLLER: Workflow controller created"
        );

        let prober = WriteCapabilityProber::new(writer, classifier.clone(), &config);
        let executor = Arc::new(CopyTaskExecutor::new(launcher, classifier, &config));
        let dispatcher = CopyDispatcher::new(executor, &config.dispatch);

        Ok(Self {
            context: Arc::new(RunContext {
                config,
                prober,
                manifest_source,
                dispatcher,
            }),
            runs: Arc::new(DashMap::new()),
        })
    }

    /// Start a run and return its id immediately
    ///
    /// Invalid input still creates a run, which fails with `InvalidInput`
    /// before leaving `Pending`. Must be called within a tokio runtime.
    #[instrument(skip(self, input), fields(destination = %input.destination))]
    pub fn start(&self, input: ExecutionInput) -> RunId {
        let run_id = Uuid::new_v4();
        let run = Arc::new(RunRecord::new(run_id, input));
        self.runs.insert(run_id, run.clone());

        info!(
            event = events::RUN_STARTED,
            run_id = %run_id,
            manifest = %run.input.source_manifest,
            "▶️ CONTROLLER: Run started"
        );

        if let Err(e) = run.input.validate() {
            run.fail(RunErrorKind::InvalidInput, e.to_string());
            run.drained.send_replace(true);
            return run_id;
        }

        let context = self.context.clone();
        tokio::spawn(async move {
            let deadline = context.config.execution.overall_deadline();
            let watchdog = {
                let run = run.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(deadline) => {
                            run.fail(
                                RunErrorKind::DeadlineExceeded,
                                format!("Overall deadline of {}s elapsed", deadline.as_secs()),
                            );
                            run.cancel.cancel();
                        }
                        _ = run.cancel.cancelled() => {}
                    }
                })
            };

            Self::drive(&context, &run).await;

            watchdog.abort();
            run.drained.send_replace(true);
            debug!(run_id = %run.run_id, "CONTROLLER: Run task finished");
        });

        run_id
    }

    /// Snapshot of a run's current state and counters
    pub fn status(&self, run_id: RunId) -> Result<RunStatus> {
        Ok(self.run(run_id)?.snapshot())
    }

    pub fn list_runs(&self) -> Vec<RunStatus> {
        let mut runs: Vec<RunStatus> = self.runs.iter().map(|r| r.value().snapshot()).collect();
        runs.sort_by_key(|status| status.started_at);
        runs
    }

    /// Final per-batch records received so far
    pub fn batch_records(&self, run_id: RunId) -> Result<Vec<BatchRecord>> {
        Ok(self.run(run_id)?.progress.batch_records())
    }

    /// Cancel a live run
    ///
    /// The run becomes `Failed(Cancelled)` immediately and no further batch is
    /// dispatched. In-flight executions are asked to stop; any that still
    /// finish are recorded as late results.
    pub fn cancel(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self.run(run_id)?;
        if !run.fail(RunErrorKind::Cancelled, "Run cancelled by operator") {
            return Err(CopyOutError::RunAlreadyTerminal(run_id.to_string()));
        }
        run.cancel.cancel();
        warn!(run_id = %run_id, "🛑 CONTROLLER: Run cancelled");
        Ok(run.snapshot())
    }

    /// Wait until the run is terminal and all its executions have drained
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self.run(run_id)?;
        let mut drained = run.drained.subscribe();
        drained
            .wait_for(|done| *done)
            .await
            .map_err(|e| CopyOutError::Internal(e.to_string()))?;
        Ok(run.snapshot())
    }

    /// Remove a finished run and return its final status
    ///
    /// Only runs that are terminal and fully drained can be removed.
    pub fn forget(&self, run_id: RunId) -> Result<RunStatus> {
        let removed = self
            .runs
            .remove_if(&run_id, |_, run| run.is_drained())
            .map(|(_, run)| run);

        match removed {
            Some(run) => {
                debug!(run_id = %run_id, "CONTROLLER: Run forgotten");
                Ok(run.snapshot())
            }
            None if self.runs.contains_key(&run_id) => {
                Err(CopyOutError::RunStillActive(run_id.to_string()))
            }
            None => Err(CopyOutError::RunNotFound(run_id.to_string())),
        }
    }

    /// Remove every drained run that finished at least `retention` ago
    pub fn prune_finished(&self, retention: chrono::Duration) -> Vec<RunId> {
        let cutoff = Utc::now() - retention;
        let expired: Vec<RunId> = self
            .runs
            .iter()
            .filter(|entry| {
                let run = entry.value();
                run.is_drained() && run.finished_at.lock().is_some_and(|at| at <= cutoff)
            })
            .map(|entry| *entry.key())
            .collect();

        let pruned: Vec<RunId> = expired
            .into_iter()
            .filter(|run_id| self.runs.remove(run_id).is_some())
            .collect();
        if !pruned.is_empty() {
            info!(pruned = pruned.len(), "🧹 CONTROLLER: Pruned finished runs");
        }
        pruned
    }

    fn run(&self, run_id: RunId) -> Result<Arc<RunRecord>> {
        self.runs
            .get(&run_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CopyOutError::RunNotFound(run_id.to_string()))
    }

    #[instrument(skip_all, fields(run_id = %run.run_id))]
    async fn drive(context: &RunContext, run: &RunRecord) {
        if run.advance(RunEvent::Start).is_err() {
            return;
        }

        let destination = run.input.destination.clone();
        let probe = context
            .prober
            .probe_until_writable(&destination, &run.cancel, |attempt| {
                let mut probe = run.probe.lock();
                probe.attempts.push(attempt.clone());
                if let ProbeResult::AccessDenied(_) = attempt.result {
                    probe.wait_cycles += 1;
                    drop(probe);
                    let _ = run.advance(RunEvent::AccessDenied);
                }
            })
            .await;

        match probe {
            Ok(report) => {
                if run.advance(RunEvent::Writable).is_err() {
                    return;
                }
                info!(
                    attempts = report.attempts.len(),
                    wait_cycles = report.wait_cycles,
                    "✅ CONTROLLER: Destination writable, dispatching"
                );
            }
            Err(ProbeError::Cancelled { .. }) => return,
            Err(e) => {
                let error: CopyOutError = e.into();
                run.fail(error.run_error_kind(), error.to_string());
                return;
            }
        }

        let max_items = run
            .input
            .resolved_max_items_per_batch(context.config.dispatch.default_max_items_per_batch);
        let batcher = ManifestBatcher::new(
            context.manifest_source.clone(),
            run.input.source_manifest.clone(),
            max_items,
            SharedParameters {
                destination_locator: run.input.destination_locator(),
            },
        );

        let batches = match batcher.batches().await {
            Ok(batches) => batches,
            Err(e) => {
                run.fail(RunErrorKind::ManifestUnreadable, e.to_string());
                return;
            }
        };

        match context
            .dispatcher
            .dispatch(batches, run.progress.clone(), &run.cancel)
            .await
        {
            Ok(summary) if summary.cancelled => {
                debug!("CONTROLLER: Dispatch drained after cancellation");
            }
            Ok(summary) if summary.within_tolerance() => {
                run.succeed();
            }
            Ok(summary) => {
                run.fail(
                    RunErrorKind::ToleratedFailureExceeded,
                    format!(
                        "{} of {} batches failed ({:.1}%), tolerance is {}%",
                        summary.failed_count,
                        summary.dispatched_count,
                        summary.failure_percentage(),
                        summary.tolerated_failure_percentage
                    ),
                );
            }
            Err(e) => {
                run.fail(RunErrorKind::ManifestUnreadable, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Posture;
    use crate::models::ManifestLocation;
    use crate::testing::{InMemoryManifestSource, ScriptedObjectWriter, SimulatedCopyWorker};

    fn input(max_items: Option<usize>) -> ExecutionInput {
        ExecutionInput::new(
            ManifestLocation::new("manifests", "run.csv"),
            "target",
            max_items,
        )
    }

    fn controller(items: usize) -> WorkflowController {
        let config = RunConfiguration::for_posture(Posture::FastIteration, "ap-southeast-2");
        let source = InMemoryManifestSource::new()
            .with_entries(&ManifestLocation::new("manifests", "run.csv"), items);
        WorkflowController::new(
            Arc::new(config),
            Arc::new(ScriptedObjectWriter::new()),
            Arc::new(source),
            Arc::new(SimulatedCopyWorker::new()),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_end_to_end() {
        let controller = controller(5);
        let run_id = controller.start(input(Some(2)));

        let status = controller.wait(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.dispatched, 3);
        assert_eq!(status.completed, 3);
        assert_eq!(status.probe_attempts.len(), 1);
        assert!(status.finished_at.is_some());
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_invalid_input() {
        let controller = controller(5);
        let run_id = controller.start(input(Some(0)));

        let status = controller.wait(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Failed(RunErrorKind::InvalidInput));
        assert!(status.probe_attempts.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let controller = controller(1);
        assert!(matches!(
            controller.status(Uuid::new_v4()),
            Err(CopyOutError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_terminal_is_rejected() {
        let controller = controller(1);
        let run_id = controller.start(input(None));
        controller.wait(run_id).await.unwrap();

        assert!(matches!(
            controller.cancel(run_id),
            Err(CopyOutError::RunAlreadyTerminal(_))
        ));
        assert_eq!(controller.list_runs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_serializes_to_json() {
        let controller = controller(2);
        let run_id = controller.start(input(None));
        let status = controller.wait(run_id).await.unwrap();

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["state"], "succeeded");
        assert_eq!(json["completed"], 2);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut config = RunConfiguration::for_posture(Posture::FastIteration, "ap-southeast-2");
        config.dispatch.max_concurrency = 0;

        let result = WorkflowController::new(
            Arc::new(config),
            Arc::new(ScriptedObjectWriter::new()),
            Arc::new(InMemoryManifestSource::new()),
            Arc::new(SimulatedCopyWorker::new()),
        );
        assert!(matches!(result, Err(CopyOutError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_carries_transition_history() {
        let controller = controller(2);
        let run_id = controller.start(input(None));
        let status = controller.wait(run_id).await.unwrap();

        let path: Vec<(RunState, RunState, RunEvent)> = status
            .transitions
            .iter()
            .map(|t| (t.from, t.to, t.event))
            .collect();
        assert_eq!(
            path,
            vec![
                (RunState::Pending, RunState::Probing, RunEvent::Start),
                (RunState::Probing, RunState::Dispatching, RunEvent::Writable),
                (RunState::Dispatching, RunState::Succeeded, RunEvent::Complete),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_removes_only_drained_runs() {
        let controller = controller(3);
        let run_id = controller.start(input(None));

        assert!(matches!(
            controller.forget(run_id),
            Err(CopyOutError::RunStillActive(_))
        ));

        controller.wait(run_id).await.unwrap();
        let status = controller.forget(run_id).unwrap();
        assert_eq!(status.state, RunState::Succeeded);
        assert!(matches!(
            controller.status(run_id),
            Err(CopyOutError::RunNotFound(_))
        ));
        assert!(matches!(
            controller.forget(run_id),
            Err(CopyOutError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_finished_keeps_live_and_recent_runs() {
        let controller = controller(2);
        let finished = controller.start(input(None));
        controller.wait(finished).await.unwrap();

        assert!(controller.prune_finished(chrono::Duration::hours(1)).is_empty());

        let live = controller.start(input(None));
        let pruned = controller.prune_finished(chrono::Duration::zero());
        assert_eq!(pruned, vec![finished]);
        assert_eq!(controller.list_runs().len(), 1);

        controller.wait(live).await.unwrap();
        assert_eq!(controller.prune_finished(chrono::Duration::zero()), vec![live]);
        assert!(controller.list_runs().is_empty());
    }
}
