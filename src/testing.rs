//! # Test Doubles
//!
//! Deterministic in-process stand-ins for the three external boundaries: the
//! object store written by the probe, the manifest source and the compute
//! substrate that runs copy tasks. Used by this crate's tests and available to
//! callers that want to exercise a [`WorkflowController`] without cloud access.
//!
//! [`WorkflowController`]: crate::orchestration::WorkflowController

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::constants::PROVIDER_CODE_ACCESS_DENIED;
use crate::models::ManifestLocation;
use crate::orchestration::{
    CopyWorkerLauncher, LaunchError, LaunchRequest, ManifestError, ManifestLines,
    ManifestSource, ObjectWriter, StorageError, TaskCompletion,
};

/// One recorded `put_object` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub region: String,
    pub destination: String,
    pub key: String,
    pub body: Vec<u8>,
}

/// Object writer that replays a script of results, then a fallback
#[derive(Debug)]
pub struct ScriptedObjectWriter {
    script: Mutex<VecDeque<Result<(), StorageError>>>,
    fallback: Mutex<Result<(), StorageError>>,
    calls: Mutex<Vec<PutCall>>,
}

impl Default for ScriptedObjectWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedObjectWriter {
    /// Every put succeeds unless scripted otherwise
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: Result<(), StorageError>) {
        self.script.lock().push_back(result);
    }

    /// Deny the next `times` puts with `AccessDenied`
    pub fn deny_times(&self, times: usize) {
        for _ in 0..times {
            self.push(Err(Self::access_denied()));
        }
    }

    /// Deny every put once the script is exhausted
    pub fn always_deny(&self) {
        *self.fallback.lock() = Err(Self::access_denied());
    }

    pub fn calls(&self) -> Vec<PutCall> {
        self.calls.lock().clone()
    }

    fn access_denied() -> StorageError {
        StorageError::new(PROVIDER_CODE_ACCESS_DENIED, "Access Denied")
    }
}

#[async_trait]
impl ObjectWriter for ScriptedObjectWriter {
    async fn put_object(
        &self,
        region: &str,
        destination: &str,
        key: &str,
        body: &[u8],
    ) -> Result<(), StorageError> {
        self.calls.lock().push(PutCall {
            region: region.to_string(),
            destination: destination.to_string(),
            key: key.to_string(),
            body: body.to_vec(),
        });
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// Manifests held in memory, optionally failing part way through
#[derive(Debug, Clone, Default)]
pub struct InMemoryManifestSource {
    manifests: HashMap<ManifestLocation, Vec<Vec<u8>>>,
    fail_after: HashMap<ManifestLocation, usize>,
}

impl InMemoryManifestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<S: Into<String>>(
        mut self,
        location: &ManifestLocation,
        lines: impl IntoIterator<Item = S>,
    ) -> Self {
        let lines = lines.into_iter().map(|line| Into::<String>::into(line).into_bytes());
        self.with_raw_lines(location, lines)
    }

    /// Rows as raw bytes, which need not be valid UTF-8
    pub fn with_raw_lines(
        mut self,
        location: &ManifestLocation,
        lines: impl IntoIterator<Item = Vec<u8>>,
    ) -> Self {
        self.manifests
            .insert(location.clone(), lines.into_iter().collect());
        self
    }

    /// `count` rows of the form `source-bucket,object-{i}`
    pub fn with_entries(self, location: &ManifestLocation, count: usize) -> Self {
        self.with_lines(
            location,
            (0..count).map(|i| format!("source-bucket,object-{i}")),
        )
    }

    /// Yield `lines` lines of the manifest, then a read error
    pub fn failing_after(mut self, location: &ManifestLocation, lines: usize) -> Self {
        self.fail_after.insert(location.clone(), lines);
        self
    }
}

#[async_trait]
impl ManifestSource for InMemoryManifestSource {
    async fn open(&self, location: &ManifestLocation) -> Result<ManifestLines, ManifestError> {
        let lines = self
            .manifests
            .get(location)
            .cloned()
            .ok_or_else(|| ManifestError::Unreadable {
                location: location.clone(),
                message: "NoSuchKey".to_string(),
            })?;

        let items: Vec<Result<Vec<u8>, ManifestError>> = match self.fail_after.get(location) {
            Some(&limit) => lines
                .into_iter()
                .take(limit)
                .map(Ok)
                .chain(std::iter::once(Err(ManifestError::ReadFailed {
                    location: location.clone(),
                    line_number: limit as u64,
                    message: "connection reset".to_string(),
                })))
                .collect(),
            None => lines.into_iter().map(Ok).collect(),
        };

        Ok(stream::iter(items).boxed())
    }
}

/// Scripted result of one simulated launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedOutcome {
    Succeed,
    /// Spot capacity reclaimed
    Preempt,
    /// Task stopped with the given exit code
    Fail(i32),
    /// Substrate refused the launch
    Reject,
}

/// One observed launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub batch_index: u64,
    pub attempt: u32,
    pub launched_at: DateTime<Utc>,
    pub request: LaunchRequest,
}

/// Compute substrate simulation with live concurrency accounting
///
/// Each launch sleeps for a random duration in the configured range (tokio
/// time, so paused-clock tests run instantly) and then reports the next
/// scripted outcome for its batch, defaulting to success.
#[derive(Debug)]
pub struct SimulatedCopyWorker {
    scripts: DashMap<u64, VecDeque<SimulatedOutcome>>,
    duration_range: Mutex<(Duration, Duration)>,
    rng: Mutex<StdRng>,
    stop_on_cancel: Mutex<bool>,
    live: AtomicUsize,
    peak: AtomicUsize,
    launches: Mutex<Vec<LaunchRecord>>,
}

impl Default for SimulatedCopyWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCopyWorker {
    pub fn new() -> Self {
        Self::with_seed(7)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            scripts: DashMap::new(),
            duration_range: Mutex::new((Duration::from_millis(1), Duration::from_millis(1))),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            stop_on_cancel: Mutex::new(false),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes for successive attempts of one batch
    pub fn script(&self, batch_index: u64, outcomes: Vec<SimulatedOutcome>) {
        self.scripts.insert(batch_index, outcomes.into());
    }

    pub fn set_duration_range(&self, min: Duration, max: Duration) {
        *self.duration_range.lock() = (min, max.max(min));
    }

    /// Stop running tasks when cancelled, instead of letting them finish
    pub fn stop_on_cancel(&self, stop: bool) {
        *self.stop_on_cancel.lock() = stop;
    }

    pub fn live_concurrency(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    fn next_outcome(&self, batch_index: u64) -> SimulatedOutcome {
        self.scripts
            .get_mut(&batch_index)
            .and_then(|mut script| script.pop_front())
            .unwrap_or(SimulatedOutcome::Succeed)
    }

    fn next_duration(&self) -> Duration {
        let (min, max) = *self.duration_range.lock();
        if min == max {
            return min;
        }
        let millis = self
            .rng
            .lock()
            .gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    fn completion(request: &LaunchRequest, exit_code: Option<i32>, reason: &str) -> TaskCompletion {
        TaskCompletion {
            exit_code,
            capacity_provider_name: Some(request.capacity.to_string()),
            stopped_reason: Some(reason.to_string()),
            stopped_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl CopyWorkerLauncher for SimulatedCopyWorker {
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskCompletion, LaunchError> {
        self.launches.lock().push(LaunchRecord {
            batch_index: request.batch_index,
            attempt: request.attempt,
            launched_at: Utc::now(),
            request: request.clone(),
        });

        let outcome = self.next_outcome(request.batch_index);
        if outcome == SimulatedOutcome::Reject {
            return Err(LaunchError::LaunchRejected {
                reason: "simulated launch rejection".to_string(),
            });
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);

        let duration = self.next_duration();
        let stop_on_cancel = *self.stop_on_cancel.lock();
        let stopped = if stop_on_cancel {
            tokio::select! {
                _ = tokio::time::sleep(duration) => false,
                _ = cancel.cancelled() => true,
            }
        } else {
            tokio::time::sleep(duration).await;
            false
        };

        self.live.fetch_sub(1, Ordering::SeqCst);

        if stopped {
            return Err(LaunchError::Cancelled);
        }

        match outcome {
            SimulatedOutcome::Succeed => Ok(Self::completion(
                request,
                Some(0),
                "Essential container in task exited",
            )),
            SimulatedOutcome::Preempt => Err(LaunchError::Preempted {
                reason: "Your Spot Task was interrupted.".to_string(),
                completion: Self::completion(request, None, "Your Spot Task was interrupted."),
            }),
            SimulatedOutcome::Fail(code) => Err(LaunchError::TaskFailed {
                exit_code: Some(code),
                reason: "Essential container in task exited".to_string(),
                completion: Self::completion(
                    request,
                    Some(code),
                    "Essential container in task exited",
                ),
            }),
            SimulatedOutcome::Reject => Err(LaunchError::LaunchRejected {
                reason: "simulated launch rejection".to_string(),
            }),
        }
    }
}
