//! # Configuration Loader
//!
//! Layered configuration loading: posture defaults, then an optional TOML file,
//! then `COPY_OUT__*` environment variables. Later layers win.
//!
//! ```text
//! COPY_OUT__DEPLOYMENT__REGION=ap-southeast-2
//! COPY_OUT__DISPATCH__MAX_CONCURRENCY=40
//! COPY_OUT__PROBE__BACKOFF_INTERVAL_SECONDS=60
//! ```

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::{ConfigResult, ConfigurationError, Posture, RunConfiguration};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "COPY_OUT";
const ENV_SEPARATOR: &str = "__";
const REGION_ENV_KEY: &str = "RCLONE_CONFIG_S3_REGION";

/// Loads and validates [`RunConfiguration`] from layered sources
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration for a posture, reading overrides from the process environment
    pub fn load(posture: Posture, file: Option<&Path>) -> ConfigResult<RunConfiguration> {
        Self::load_from_sources(posture, file, None)
    }

    /// Load configuration with an explicit environment map instead of the process environment
    pub fn load_from_sources(
        posture: Posture,
        file: Option<&Path>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<RunConfiguration> {
        // Layered keys are case-folded, so the worker environment is rebuilt after merging
        let mut defaults = RunConfiguration::for_posture(posture, "");
        defaults.worker.environment.clear();
        let mut builder = Config::builder().add_source(Config::try_from(&defaults)?);

        if let Some(path) = file {
            if !path.exists() {
                return Err(ConfigurationError::ConfigFileNotFound {
                    path: path.to_path_buf(),
                });
            }
            debug!(path = %path.display(), "Adding configuration file layer");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env_overrides);
        builder = builder.add_source(environment);

        let mut config: RunConfiguration = builder.build()?.try_deserialize()?;

        config.worker.environment = if config.worker.environment.is_empty() {
            RunConfiguration::for_posture(posture, config.deployment.region.clone())
                .worker
                .environment
        } else {
            config
                .worker
                .environment
                .into_iter()
                .map(|(key, value)| (key.to_uppercase(), value))
                .collect()
        };

        // The copy tool's remote region follows the deployment unless set explicitly
        let region_unset = config
            .worker
            .environment
            .get(REGION_ENV_KEY)
            .map_or(true, |value| value.is_empty());
        if region_unset {
            config
                .worker
                .environment
                .insert(REGION_ENV_KEY.to_string(), config.deployment.region.clone());
        }

        config.validate()?;

        info!(
            posture = %config.deployment.posture,
            region = %config.deployment.region,
            max_concurrency = config.dispatch.max_concurrency,
            tolerated_failure_percentage = config.dispatch.tolerated_failure_percentage,
            overall_deadline_seconds = config.execution.overall_deadline_seconds,
            "⚙️ CONFIG: Run configuration loaded"
        );

        Ok(config)
    }
}
