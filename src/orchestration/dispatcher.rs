//! # Distributed Copy Dispatcher
//!
//! Pulls batches from the batcher and runs each through the copy task executor
//! with at most `max_concurrency` executions in flight. A batch is only pulled
//! from the manifest once a slot is free, so the semaphore is also the
//! backpressure point for manifest reads.
//!
//! Batches are independent: a failed batch never cancels the others. The
//! success verdict is computed once every pulled batch has reached a final
//! outcome.

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::copy_task_executor::CopyTaskExecutor;
use super::manifest_batcher::{BatchStream, ManifestError};
use super::types::{BatchRecord, DispatchOutcome, DispatchSummary, FailedBatch};
use crate::config::DispatchConfig;
use crate::constants::{events, BATCH_RECORD_HISTORY};
use crate::models::Batch;

/// Live counters and per-batch ledger for one run
///
/// Written by the dispatcher and its executions, read by status snapshots.
/// Counters and failed batches cover the whole run. Full records are kept for
/// every batch that failed or finished after cancellation; other records are
/// kept only for the most recent `history` batches.
#[derive(Debug)]
pub struct DispatchProgress {
    dispatched: AtomicU64,
    in_flight: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retained: DashMap<u64, BatchRecord>,
    recent: Mutex<VecDeque<BatchRecord>>,
    history: usize,
    failed_batches: Mutex<Vec<FailedBatch>>,
}

impl Default for DispatchProgress {
    fn default() -> Self {
        Self::with_history(BATCH_RECORD_HISTORY)
    }
}

impl DispatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retained: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(history.min(1024))),
            history,
            failed_batches: Mutex::new(Vec::new()),
        }
    }

    fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn record_outcome(&self, record: BatchRecord, failed: Option<FailedBatch>) {
        let succeeded = record.outcome == DispatchOutcome::Succeeded;
        if succeeded {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(failed) = failed {
            self.failed_batches.lock().push(failed);
        }

        if !succeeded || record.after_cancel {
            self.retained.insert(record.index, record);
        } else if self.history > 0 {
            let mut recent = self.recent.lock();
            if recent.len() == self.history {
                recent.pop_front();
            }
            recent.push_back(record);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Count an execution whose task died without producing a record
    fn record_lost(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retained final records, ordered by batch index
    ///
    /// Every failed or after-cancel record, plus the most recent successes.
    pub fn batch_records(&self) -> Vec<BatchRecord> {
        let mut records: Vec<BatchRecord> = self
            .retained
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.extend(self.recent.lock().iter().cloned());
        records.sort_by_key(|record| record.index);
        records
    }

    /// Failed batches ordered by batch index
    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        let mut failed = self.failed_batches.lock().clone();
        failed.sort_by_key(|batch| batch.index);
        failed
    }

    pub fn summary(&self, tolerated_failure_percentage: f64, cancelled: bool) -> DispatchSummary {
        DispatchSummary {
            dispatched_count: self.dispatched(),
            completed_count: self.completed(),
            failed_count: self.failed(),
            tolerated_failure_percentage,
            cancelled,
            failed_batches: self.failed_batches(),
        }
    }
}

pub struct CopyDispatcher {
    executor: Arc<CopyTaskExecutor>,
    max_concurrency: usize,
    tolerated_failure_percentage: f64,
}

impl CopyDispatcher {
    pub fn new(executor: Arc<CopyTaskExecutor>, config: &DispatchConfig) -> Self {
        Self {
            executor,
            max_concurrency: config.max_concurrency.max(1),
            tolerated_failure_percentage: config.tolerated_failure_percentage,
        }
    }

    /// Dispatch every batch and wait for all of them to finish
    ///
    /// Cancellation stops new dispatch immediately; executions already started
    /// are drained and their results recorded with `after_cancel` set. A read
    /// failure mid-manifest also stops dispatch and drains, then returns the
    /// error.
    #[instrument(skip_all, fields(max_concurrency = self.max_concurrency))]
    pub async fn dispatch(
        &self,
        mut batches: BatchStream,
        progress: Arc<DispatchProgress>,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary, ManifestError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut executions: JoinSet<()> = JoinSet::new();
        let mut manifest_error = None;

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = executions.join_next(), if !executions.is_empty() => {
                    Self::absorb_join(joined, &progress);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = batches.next() => next,
            };

            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    error!(error = %e, "❌ DISPATCHER: Manifest read failed, stopping dispatch");
                    manifest_error = Some(e);
                    break;
                }
                None => break,
            };

            if cancel.is_cancelled() {
                break;
            }

            let dispatched_at = Utc::now();
            progress.record_dispatch();
            info!(
                event = events::BATCH_DISPATCHED,
                batch_index = batch.index,
                items = batch.len(),
                in_flight = progress.in_flight(),
                "📤 DISPATCHER: Batch dispatched"
            );

            let executor = self.executor.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            executions.spawn(async move {
                let _permit = permit;
                let mut record = executor.execute(&batch, &cancel).await;
                record.dispatched_at = dispatched_at;
                let failed = Self::failed_batch(&batch, &record);
                Self::log_outcome(&record);
                progress.record_outcome(record, failed);
            });
        }

        let in_flight = executions.len();
        if in_flight > 0 {
            info!(in_flight, "⏳ DISPATCHER: Draining in-flight executions");
        }
        while let Some(joined) = executions.join_next().await {
            Self::absorb_join(joined, &progress);
        }

        if let Some(e) = manifest_error {
            return Err(e);
        }

        let summary = progress.summary(self.tolerated_failure_percentage, cancel.is_cancelled());
        info!(
            dispatched = summary.dispatched_count,
            completed = summary.completed_count,
            failed = summary.failed_count,
            failure_percentage = summary.failure_percentage(),
            cancelled = summary.cancelled,
            "📊 DISPATCHER: All dispatched batches finished"
        );
        Ok(summary)
    }

    fn absorb_join(joined: Result<(), tokio::task::JoinError>, progress: &DispatchProgress) {
        if let Err(e) = joined {
            error!(error = %e, "❌ DISPATCHER: Batch execution task died");
            progress.record_lost();
        }
    }

    fn failed_batch(batch: &Batch, record: &BatchRecord) -> Option<FailedBatch> {
        if record.outcome == DispatchOutcome::Succeeded {
            return None;
        }
        Some(FailedBatch {
            index: batch.index,
            source_locators: batch.known_locators(),
            error: record.attempts.last().and_then(|a| a.error.clone()),
        })
    }

    fn log_outcome(record: &BatchRecord) {
        match record.outcome {
            DispatchOutcome::Succeeded => info!(
                event = events::BATCH_SUCCEEDED,
                batch_index = record.index,
                attempts = record.attempts.len(),
                after_cancel = record.after_cancel,
                "✅ DISPATCHER: Batch succeeded"
            ),
            _ => warn!(
                event = events::BATCH_FAILED,
                batch_index = record.index,
                attempts = record.attempts.len(),
                after_cancel = record.after_cancel,
                "❌ DISPATCHER: Batch failed terminally"
            ),
        }
    }
}
