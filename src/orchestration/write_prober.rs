//! # Write-Capability Prober
//!
//! Writes a small marker object to the destination before any batch is
//! dispatched. The object-store client is always bound to the deployment
//! region, so a destination in another region surfaces as a redirect instead of
//! being followed.
//!
//! Denied writes are retried after a fixed backoff for as long as the run is
//! alive. The run deadline is enforced by the workflow controller through the
//! cancellation token, never by the prober itself.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error_classifier::{ErrorClassifier, WriteFailureKind};
use super::types::{ProbeAttempt, ProbeResult, StorageError};
use crate::config::RunConfiguration;
use crate::constants::events;

/// Object-storage put boundary
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Put `body` at `key` in `destination` using a client bound to `region`
    async fn put_object(
        &self,
        region: &str,
        destination: &str,
        key: &str,
        body: &[u8],
    ) -> Result<(), StorageError>;
}

/// Terminal probe outcomes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Destination '{destination}' is not in the required region: {message}")]
    WrongRegion {
        destination: String,
        message: String,
    },

    #[error("Unclassified write failure against '{destination}': {source}")]
    Unclassified {
        destination: String,
        source: StorageError,
    },

    #[error("Probe of '{destination}' cancelled after {attempts} attempts")]
    Cancelled { destination: String, attempts: u32 },
}

/// A marker put, with any failure paired with its classification
type MarkerWrite = Result<(), (WriteFailureKind, StorageError)>;

/// Summary of a successful probe loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: Vec<ProbeAttempt>,
    /// Number of backoff waits taken after an access denial
    pub wait_cycles: u32,
}

pub struct WriteCapabilityProber {
    writer: Arc<dyn ObjectWriter>,
    classifier: Arc<dyn ErrorClassifier>,
    region: String,
    marker_key: String,
    marker_body: String,
    backoff_interval: Duration,
}

impl WriteCapabilityProber {
    pub fn new(
        writer: Arc<dyn ObjectWriter>,
        classifier: Arc<dyn ErrorClassifier>,
        config: &RunConfiguration,
    ) -> Self {
        Self {
            writer,
            classifier,
            region: config.deployment.region.clone(),
            marker_key: config.probe.marker_key.clone(),
            marker_body: config.probe.marker_body.clone(),
            backoff_interval: config.probe.backoff_interval(),
        }
    }

    /// Perform one marker write and classify the result
    pub async fn probe_once(&self, destination: &str) -> ProbeResult {
        probe_result(&self.write_marker(destination).await)
    }

    /// One marker write, keeping the provider error next to its classification
    async fn write_marker(&self, destination: &str) -> MarkerWrite {
        self.writer
            .put_object(
                &self.region,
                destination,
                &self.marker_key,
                self.marker_body.as_bytes(),
            )
            .await
            .map_err(|error| (self.classifier.classify_write_failure(&error), error))
    }

    /// Probe until the destination is writable or the failure is terminal
    ///
    /// `on_attempt` sees every attempt as it is recorded, before any wait.
    #[instrument(skip(self, cancel, on_attempt), fields(region = %self.region))]
    pub async fn probe_until_writable<F>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        mut on_attempt: F,
    ) -> Result<ProbeReport, ProbeError>
    where
        F: FnMut(&ProbeAttempt) + Send,
    {
        let mut attempts = Vec::new();
        let mut wait_cycles = 0u32;

        loop {
            let attempt_number = attempts.len() as u32 + 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProbeError::Cancelled {
                        destination: destination.to_string(),
                        attempts: attempts.len() as u32,
                    });
                }
                outcome = self.write_marker(destination) => outcome,
            };
            let result = probe_result(&outcome);

            let attempt = ProbeAttempt {
                attempt: attempt_number,
                result: result.clone(),
                at: Utc::now(),
            };
            info!(
                event = events::PROBE_ATTEMPTED,
                destination = %destination,
                attempt = attempt_number,
                result = %result,
                "🔎 PROBE: Marker write attempted"
            );
            on_attempt(&attempt);
            attempts.push(attempt);

            match outcome {
                Ok(()) => {
                    return Ok(ProbeReport {
                        attempts,
                        wait_cycles,
                    })
                }
                Err((WriteFailureKind::WrongRegion, error)) => {
                    warn!(
                        destination = %destination,
                        %error,
                        "❌ PROBE: Destination is in the wrong region"
                    );
                    return Err(ProbeError::WrongRegion {
                        destination: destination.to_string(),
                        message: error.to_string(),
                    });
                }
                Err((WriteFailureKind::Unclassified, error)) => {
                    warn!(
                        destination = %destination,
                        %error,
                        "❌ PROBE: Unclassified write failure"
                    );
                    return Err(ProbeError::Unclassified {
                        destination: destination.to_string(),
                        source: error,
                    });
                }
                Err((WriteFailureKind::AccessDenied, error)) => {
                    wait_cycles += 1;
                    info!(
                        event = events::PROBE_WAITING,
                        destination = %destination,
                        wait_cycle = wait_cycles,
                        backoff_secs = self.backoff_interval.as_secs(),
                        %error,
                        "⏳ PROBE: Access denied, waiting before next probe"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(
                                destination = %destination,
                                "PROBE: Wait interrupted by cancellation"
                            );
                            return Err(ProbeError::Cancelled {
                                destination: destination.to_string(),
                                attempts: attempts.len() as u32,
                            });
                        }
                        _ = tokio::time::sleep(self.backoff_interval) => {}
                    }
                }
            }
        }
    }
}

fn probe_result(outcome: &MarkerWrite) -> ProbeResult {
    match outcome {
        Ok(()) => ProbeResult::Writable,
        Err((WriteFailureKind::WrongRegion, error)) => ProbeResult::WrongRegion(error.to_string()),
        Err((WriteFailureKind::AccessDenied, error)) => {
            ProbeResult::AccessDenied(error.to_string())
        }
        Err((WriteFailureKind::Unclassified, error)) => {
            ProbeResult::OtherFailure(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Posture;
    use crate::orchestration::error_classifier::StandardErrorClassifier;
    use crate::testing::ScriptedObjectWriter;

    fn prober(writer: Arc<ScriptedObjectWriter>) -> WriteCapabilityProber {
        let config = RunConfiguration::for_posture(Posture::FastIteration, "ap-southeast-2");
        WriteCapabilityProber::new(writer, Arc::new(StandardErrorClassifier::new()), &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_denied_then_writable() {
        let writer = Arc::new(ScriptedObjectWriter::new());
        writer.deny_times(3);
        let prober = prober(writer.clone());

        let mut seen = 0;
        let report = prober
            .probe_until_writable("target", &CancellationToken::new(), |_| seen += 1)
            .await
            .unwrap();

        assert_eq!(report.wait_cycles, 3);
        assert_eq!(report.attempts.len(), 4);
        assert_eq!(seen, 4);
        assert_eq!(report.attempts[3].result, ProbeResult::Writable);

        let calls = writer.calls();
        assert!(calls.iter().all(|c| c.region == "ap-southeast-2"));
        assert!(calls.iter().all(|c| c.key == "STARTED_TRANSFER.txt"));
    }

    #[tokio::test]
    async fn test_permanent_redirect_is_not_retried() {
        let writer = Arc::new(ScriptedObjectWriter::new());
        writer.push(Err(StorageError::new("PermanentRedirect", "wrong endpoint")));
        let prober = prober(writer.clone());

        let err = prober
            .probe_until_writable("target", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::WrongRegion { .. }));
        assert_eq!(writer.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unclassified_failure_is_fatal() {
        let writer = Arc::new(ScriptedObjectWriter::new());
        writer.push(Err(StorageError::new("NoSuchBucket", "gone")));
        let err = prober(writer)
            .probe_until_writable("target", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProbeError::Unclassified {
                destination: "target".to_string(),
                source: StorageError::new("NoSuchBucket", "gone"),
            }
        );
        assert!(err.to_string().ends_with("NoSuchBucket: gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let writer = Arc::new(ScriptedObjectWriter::new());
        writer.always_deny();
        let prober = prober(writer);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(95)).await;
                cancel.cancel();
            })
        };

        let err = prober
            .probe_until_writable("target", &cancel, |_| {})
            .await
            .unwrap_err();
        canceller.await.unwrap();

        // Attempts at t=0, 30, 60 and 90 seconds
        assert_eq!(
            err,
            ProbeError::Cancelled {
                destination: "target".to_string(),
                attempts: 4
            }
        );
    }
}
