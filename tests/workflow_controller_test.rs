//! End-to-end runs through the workflow controller with in-process doubles.

use std::sync::Arc;
use std::time::Duration;

use copy_out_core::config::{Posture, RunConfiguration};
use copy_out_core::error::RunErrorKind;
use copy_out_core::models::{ExecutionInput, ManifestLocation};
use copy_out_core::orchestration::{DispatchOutcome, ProbeResult, StorageError, WorkflowController};
use copy_out_core::state_machine::{RunEvent, RunState};
use copy_out_core::testing::{
    InMemoryManifestSource, ScriptedObjectWriter, SimulatedCopyWorker, SimulatedOutcome,
};

struct TestRun {
    controller: WorkflowController,
    writer: Arc<ScriptedObjectWriter>,
    worker: Arc<SimulatedCopyWorker>,
}

fn manifest() -> ManifestLocation {
    ManifestLocation::new("manifests", "copy-out.csv")
}

fn input() -> ExecutionInput {
    ExecutionInput::new(manifest(), "partner-target", None)
}

fn setup(items: usize, tweak: impl FnOnce(&mut RunConfiguration)) -> TestRun {
    let mut config = RunConfiguration::for_posture(Posture::FastIteration, "ap-southeast-2");
    tweak(&mut config);

    let writer = Arc::new(ScriptedObjectWriter::new());
    let worker = Arc::new(SimulatedCopyWorker::new());
    let source = InMemoryManifestSource::new().with_entries(&manifest(), items);

    TestRun {
        controller: WorkflowController::new(
            Arc::new(config),
            writer.clone(),
            Arc::new(source),
            worker.clone(),
        )
        .unwrap(),
        writer,
        worker,
    }
}

#[tokio::test(start_paused = true)]
async fn permanent_redirect_fails_without_retry() {
    let run = setup(10, |_| {});
    run.writer
        .push(Err(StorageError::new("PermanentRedirect", "bucket is in us-east-1")));

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed(RunErrorKind::WrongRegion));
    assert_eq!(status.probe_attempts.len(), 1);
    assert_eq!(status.probe_wait_cycles, 0);
    assert_eq!(status.dispatched, 0);
    assert_eq!(run.writer.calls().len(), 1);
    assert_eq!(run.worker.launch_count(), 0);
    assert_eq!(status.error.unwrap().kind, RunErrorKind::WrongRegion);
}

#[tokio::test(start_paused = true)]
async fn access_denied_waits_then_dispatches() {
    let run = setup(4, |_| {});
    run.writer.deny_times(5);

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.probe_wait_cycles, 5);
    assert_eq!(status.probe_attempts.len(), 6);
    // Start, five denial self-loops, writable, complete
    assert_eq!(status.transitions.len(), 8);
    assert!(status.transitions[1..6]
        .iter()
        .all(|t| t.event == RunEvent::AccessDenied && t.to == RunState::Probing));
    assert_eq!(status.transitions[6].to, RunState::Dispatching);
    assert_eq!(status.probe_attempts[5].result, ProbeResult::Writable);
    assert!(status.probe_attempts[..5]
        .iter()
        .all(|a| matches!(a.result, ProbeResult::AccessDenied(_))));
    assert_eq!(status.completed, 4);

    let calls = run.writer.calls();
    assert!(calls.iter().all(|c| c.region == "ap-southeast-2"));
    assert!(calls.iter().all(|c| c.destination == "partner-target"));
}

#[tokio::test(start_paused = true)]
async fn unclassified_probe_failure_is_fatal() {
    let run = setup(4, |_| {});
    run.writer
        .push(Err(StorageError::without_code("connection refused")));

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed(RunErrorKind::Unclassified));
    assert_eq!(run.worker.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unclassified_failure_keeps_provider_code() {
    let run = setup(4, |_| {});
    run.writer.push(Err(StorageError::new("NoSuchBucket", "gone")));

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    let error = status.error.unwrap();
    assert_eq!(error.kind, RunErrorKind::Unclassified);
    assert!(error.message.contains("NoSuchBucket: gone"), "{}", error.message);
    assert!(!error.message.contains("NoCode"), "{}", error.message);
}

#[tokio::test(start_paused = true)]
async fn undecodable_manifest_row_fails_only_its_batch() {
    let writer = Arc::new(ScriptedObjectWriter::new());
    let worker = Arc::new(SimulatedCopyWorker::new());
    let source = InMemoryManifestSource::new().with_raw_lines(
        &manifest(),
        vec![
            b"bucket,a.bam".to_vec(),
            b"bucket,b\xff\xfe.bam".to_vec(),
            b"bucket,c.bam".to_vec(),
            b"bucket,d.bam".to_vec(),
        ],
    );
    let controller = WorkflowController::new(
        Arc::new(RunConfiguration::for_posture(
            Posture::FastIteration,
            "ap-southeast-2",
        )),
        writer,
        Arc::new(source),
        worker.clone(),
    )
    .unwrap();

    let run_id = controller.start(input());
    let status = controller.wait(run_id).await.unwrap();

    // One failure in four is within the default 25% tolerance
    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.dispatched, 4);
    assert_eq!(status.completed, 3);
    assert_eq!(status.failed, 1);
    assert_eq!(status.failed_batches.len(), 1);
    assert_eq!(status.failed_batches[0].index, 1);
    assert_eq!(worker.launch_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn twenty_four_percent_failure_is_tolerated() {
    let run = setup(100, |_| {});
    for index in 0..24 {
        run.worker.script(index * 4, vec![SimulatedOutcome::Reject]);
    }

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.completed, 76);
    assert_eq!(status.failed, 24);
    assert_eq!(status.failed_batches.len(), 24);
    assert_eq!(
        status.failed_batches[1].source_locators,
        vec!["s3:source-bucket/object-4"]
    );
}

#[tokio::test(start_paused = true)]
async fn twenty_six_percent_failure_fails_the_run() {
    let run = setup(100, |_| {});
    for index in 0..26 {
        run.worker.script(
            index,
            vec![
                SimulatedOutcome::Preempt,
                SimulatedOutcome::Preempt,
                SimulatedOutcome::Preempt,
            ],
        );
    }

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(
        status.state,
        RunState::Failed(RunErrorKind::ToleratedFailureExceeded)
    );
    assert_eq!(status.completed, 74);
    assert_eq!(status.failed, 26);
    // Every failed batch was attempted the full three times
    assert_eq!(run.worker.launch_count(), 74 + 26 * 3);
}

#[tokio::test(start_paused = true)]
async fn preempted_batches_are_retried_to_success() {
    let run = setup(3, |_| {});
    run.worker.script(
        1,
        vec![SimulatedOutcome::Preempt, SimulatedOutcome::Preempt],
    );

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Succeeded);

    let records = run.controller.batch_records(run_id).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].outcome, DispatchOutcome::Succeeded);
    assert_eq!(records[1].attempts.len(), 3);
    assert_eq!(records[0].attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_size_groups_items_into_one_launch() {
    let run = setup(7, |_| {});
    let run_id = run
        .controller
        .start(ExecutionInput::new(manifest(), "partner-target", Some(3)));
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.dispatched, 3);

    let mut launches = run.worker.launches();
    launches.sort_by_key(|l| l.batch_index);
    assert_eq!(launches[0].request.command.len(), 3);
    assert_eq!(launches[2].request.command, vec!["s3:source-bucket/object-6"]);
    assert_eq!(
        launches[0].request.environment.get("destination"),
        Some(&"s3:partner-target".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn missing_manifest_is_unreadable() {
    let run = setup(0, |_| {});
    let run_id = run.controller.start(ExecutionInput::new(
        ManifestLocation::new("manifests", "absent.csv"),
        "partner-target",
        None,
    ));
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed(RunErrorKind::ManifestUnreadable));
    assert_eq!(status.dispatched, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_manifest_succeeds() {
    let run = setup(0, |_| {});
    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Succeeded);
    assert_eq!(status.dispatched, 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_elapses_while_probing() {
    let run = setup(5, |config| config.execution.overall_deadline_seconds = 120);
    run.writer.always_deny();

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed(RunErrorKind::DeadlineExceeded));
    // Probes at 0, 30, 60, 90 and 120 seconds race the deadline; at least four ran
    assert!(status.probe_attempts.len() >= 4);
    assert_eq!(status.dispatched, 0);
    assert_eq!(run.worker.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_elapses_while_dispatching() {
    let run = setup(20, |config| {
        config.execution.overall_deadline_seconds = 60;
        config.dispatch.max_concurrency = 2;
    });
    run.worker
        .set_duration_range(Duration::from_secs(25), Duration::from_secs(25));

    let run_id = run.controller.start(input());
    let status = run.controller.wait(run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed(RunErrorKind::DeadlineExceeded));
    assert!(status.dispatched < 20);
    assert_eq!(status.in_flight, 0);

    let records = run.controller.batch_records(run_id).unwrap();
    assert!(records.iter().any(|r| r.after_cancel));
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_dispatch_and_records_late_results() {
    let run = setup(50, |config| config.dispatch.max_concurrency = 5);
    run.worker
        .set_duration_range(Duration::from_secs(10), Duration::from_secs(40));

    let run_id = run.controller.start(input());
    tokio::time::sleep(Duration::from_secs(45)).await;

    let cancelled = run.controller.cancel(run_id).unwrap();
    let cancelled_at = chrono::Utc::now();
    let dispatched_at_cancel = cancelled.dispatched;
    assert_eq!(cancelled.state, RunState::Failed(RunErrorKind::Cancelled));
    assert!(dispatched_at_cancel > 0 && dispatched_at_cancel < 50);

    let status = run.controller.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed(RunErrorKind::Cancelled));
    assert_eq!(status.dispatched, dispatched_at_cancel);
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.completed + status.failed, dispatched_at_cancel);

    let records = run.controller.batch_records(run_id).unwrap();
    assert!(records.iter().all(|r| r.dispatched_at <= cancelled_at));
    assert!(records.iter().any(|r| r.after_cancel));
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_probe_wait() {
    let run = setup(5, |_| {});
    run.writer.always_deny();

    let run_id = run.controller.start(input());
    tokio::time::sleep(Duration::from_secs(45)).await;
    run.controller.cancel(run_id).unwrap();

    let status = run.controller.wait(run_id).await.unwrap();
    assert_eq!(status.state, RunState::Failed(RunErrorKind::Cancelled));
    assert_eq!(status.probe_attempts.len(), 2);
    assert_eq!(run.worker.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stoppable_workers_end_as_failed_after_cancel() {
    let run = setup(10, |config| config.dispatch.max_concurrency = 10);
    run.worker.stop_on_cancel(true);
    run.worker
        .set_duration_range(Duration::from_secs(300), Duration::from_secs(300));

    let run_id = run.controller.start(input());
    tokio::time::sleep(Duration::from_secs(10)).await;
    run.controller.cancel(run_id).unwrap();

    let status = run.controller.wait(run_id).await.unwrap();
    assert_eq!(status.failed, 10);
    // Cancelled tasks are not relaunched
    assert_eq!(run.worker.launch_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn runs_are_isolated() {
    let run = setup(3, |_| {});
    let first = run.controller.start(input());
    let second = run.controller.start(input());
    assert_ne!(first, second);

    run.controller.wait(first).await.unwrap();
    run.controller.wait(second).await.unwrap();

    let runs = run.controller.list_runs();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|s| s.state == RunState::Succeeded));
    assert!(runs.iter().all(|s| s.completed == 3));
}
