//! # Copy-Out Configuration System
//!
//! A single immutable [`RunConfiguration`] carries every per-deployment parameter
//! the workflow needs: which account and region the destination must live in,
//! the operating posture, dispatch bounds, probe cadence, retry policy, the run
//! deadline and the launch template for the external copy tool.
//!
//! ## Postures
//!
//! - **Production**: destinations may be provisioned by a third party after the
//!   run starts, so the probe waits minutes between attempts and the run may
//!   legitimately last for weeks.
//! - **Fast iteration**: short waits and an hours-long deadline for development
//!   and demonstration stacks.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use copy_out_core::config::{ConfigManager, Posture};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load(Posture::Production, None)?;
//! let concurrency = config.dispatch.max_concurrency;
//! let deadline = config.execution.overall_deadline();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Operating posture of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Production,
    FastIteration,
}

impl fmt::Display for Posture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::FastIteration => write!(f, "fast_iteration"),
        }
    }
}

impl FromStr for Posture {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Self::Production),
            "fast_iteration" | "development" => Ok(Self::FastIteration),
            other => Err(ConfigurationError::UnknownPosture(other.to_string())),
        }
    }
}

/// Root configuration handed to the workflow controller at construction
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunConfiguration {
    /// Account, region and posture of this deployment
    pub deployment: DeploymentConfig,

    /// Bounded distributed map settings
    pub dispatch: DispatchConfig,

    /// Destination write probe settings
    pub probe: ProbeConfig,

    /// Deadline and per-batch retry policy
    pub execution: ExecutionConfig,

    /// Launch template for the external copy tool
    pub worker: WorkerLaunchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeploymentConfig {
    pub account: String,
    /// Region the destination must be in; the probe client is bound to it
    pub region: String,
    pub posture: Posture,
    /// Tags propagated onto every worker launch
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Ceiling on concurrently in-flight batch executions
    pub max_concurrency: usize,
    /// Share of failed batches (0-100) a run may absorb and still succeed
    pub tolerated_failure_percentage: f64,
    /// Applied when an execution input omits `maxItemsPerBatch`
    pub default_max_items_per_batch: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub backoff_interval_seconds: u64,
    pub marker_key: String,
    pub marker_body: String,
}

impl ProbeConfig {
    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionConfig {
    pub overall_deadline_seconds: u64,
    pub max_retry_attempts_per_batch: u32,
    pub retry_interval_seconds: u64,
    pub retry_backoff_rate: f64,
    /// Ceiling on any single retry delay
    #[serde(default = "default_max_retry_delay_seconds")]
    pub max_retry_delay_seconds: u64,
}

fn default_max_retry_delay_seconds() -> u64 {
    crate::constants::DEFAULT_MAX_RETRY_DELAY_SECONDS
}

impl ExecutionConfig {
    pub fn overall_deadline(&self) -> Duration {
        Duration::from_secs(self.overall_deadline_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_seconds)
    }

    /// Delay before retrying after the given (1-based) failed attempt
    ///
    /// Grows by `retry_backoff_rate` per attempt and saturates at
    /// `max_retry_delay_seconds`.
    pub fn retry_delay(&self, failed_attempt: u32) -> Duration {
        let max_delay = self.max_retry_delay();
        if self.retry_interval_seconds == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.retry_interval_seconds as f64 * self.retry_backoff_rate.powi(exponent);
        if !seconds.is_finite() || seconds >= max_delay.as_secs_f64() {
            return max_delay;
        }
        Duration::try_from_secs_f64(seconds).map_or(max_delay, |delay| delay.min(max_delay))
    }
}

/// Compute capacity a worker is launched onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityProvider {
    /// Cost-optimized, interruptible capacity
    Spot,
    OnDemand,
}

impl fmt::Display for CapacityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "FARGATE_SPOT"),
            Self::OnDemand => write!(f, "FARGATE"),
        }
    }
}

/// Per-batch task template for the copy tool
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerLaunchConfig {
    /// Executable (or image entrypoint) of the copy tool
    pub program: String,
    pub container_name: String,
    pub cpu_units: u32,
    pub memory_mib: u32,
    pub stop_timeout_seconds: u64,
    pub platform_version: String,
    pub capacity: CapacityProvider,
    /// Static environment passed to every launch
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub propagate_tags: bool,
}

impl WorkerLaunchConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

impl RunConfiguration {
    /// Defaults for the given posture in the given region
    pub fn for_posture(posture: Posture, region: impl Into<String>) -> Self {
        let region = region.into();
        let (backoff_interval_seconds, overall_deadline_seconds) = match posture {
            Posture::Production => (10 * 60, 30 * 24 * 60 * 60),
            Posture::FastIteration => (30, 24 * 60 * 60),
        };

        let mut environment = BTreeMap::new();
        environment.insert("RCLONE_CONFIG_S3_TYPE".to_string(), "s3".to_string());
        environment.insert("RCLONE_CONFIG_S3_PROVIDER".to_string(), "AWS".to_string());
        environment.insert("RCLONE_CONFIG_S3_ENV_AUTH".to_string(), "true".to_string());
        environment.insert("RCLONE_CONFIG_S3_REGION".to_string(), region.clone());

        Self {
            deployment: DeploymentConfig {
                account: String::new(),
                region,
                posture,
                tags: BTreeMap::new(),
            },
            dispatch: DispatchConfig {
                max_concurrency: crate::constants::DEFAULT_MAX_CONCURRENCY,
                tolerated_failure_percentage:
                    crate::constants::DEFAULT_TOLERATED_FAILURE_PERCENTAGE,
                default_max_items_per_batch: crate::constants::DEFAULT_MAX_ITEMS_PER_BATCH,
            },
            probe: ProbeConfig {
                backoff_interval_seconds,
                marker_key: crate::constants::MARKER_OBJECT_KEY.to_string(),
                marker_body: crate::constants::MARKER_OBJECT_BODY.to_string(),
            },
            execution: ExecutionConfig {
                overall_deadline_seconds,
                max_retry_attempts_per_batch: crate::constants::DEFAULT_MAX_RETRY_ATTEMPTS,
                retry_interval_seconds: 1,
                retry_backoff_rate: 2.0,
                max_retry_delay_seconds: crate::constants::DEFAULT_MAX_RETRY_DELAY_SECONDS,
            },
            worker: WorkerLaunchConfig {
                program: "rclone-batch-copy".to_string(),
                container_name: "RcloneContainer".to_string(),
                cpu_units: 256,
                memory_mib: 512,
                stop_timeout_seconds: 120,
                platform_version: "1.4.0".to_string(),
                capacity: CapacityProvider::Spot,
                environment,
                propagate_tags: true,
            },
        }
    }

    /// Check invariants that deserialization alone cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.deployment.region.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "region",
                "deployment",
            ));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.max_concurrency",
                self.dispatch.max_concurrency,
                "must be at least 1",
            ));
        }
        let pct = self.dispatch.tolerated_failure_percentage;
        if !(0.0..=100.0).contains(&pct) {
            return Err(ConfigurationError::invalid_value(
                "dispatch.tolerated_failure_percentage",
                pct,
                "must be between 0 and 100",
            ));
        }
        if self.dispatch.default_max_items_per_batch == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatch.default_max_items_per_batch",
                0,
                "must be at least 1",
            ));
        }
        if self.execution.max_retry_attempts_per_batch == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_retry_attempts_per_batch",
                0,
                "must be at least 1",
            ));
        }
        if self.execution.overall_deadline_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.overall_deadline_seconds",
                0,
                "must be greater than zero",
            ));
        }
        let rate = self.execution.retry_backoff_rate;
        if !rate.is_finite() || rate < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "execution.retry_backoff_rate",
                rate,
                "must be a finite number of at least 1.0",
            ));
        }
        if self.execution.max_retry_delay_seconds < self.execution.retry_interval_seconds {
            return Err(ConfigurationError::invalid_value(
                "execution.max_retry_delay_seconds",
                self.execution.max_retry_delay_seconds,
                "must not be shorter than execution.retry_interval_seconds",
            ));
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "program", "worker",
            ));
        }
        Ok(())
    }
}
