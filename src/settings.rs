//! Layered configuration.
//!
//! Settings come from an optional TOML file (default `testrelay.toml` in the
//! working directory) overridden by `TESTRELAY__`-prefixed environment
//! variables, e.g. `TESTRELAY__CI__REPOSITORY=acme/app` or
//! `TESTRELAY__TIMEOUTS__PRIMARY_WAIT_SECS=30`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::ci::github::{parse_repository, DEFAULT_BRANCH, DEFAULT_WORKFLOW};
use crate::error::ConfigurationError;
use crate::timeout::TimeoutConfig;

/// Config file read when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "testrelay.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "TESTRELAY";

/// Token fallback when none is configured.
pub const GITHUB_TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

/// All settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory the execution journal is written under. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_dir: Option<PathBuf>,
    pub ci: CiSettings,
    pub backend: BackendSettings,
    pub relay: RelaySettings,
    pub timeouts: TimeoutSettings,
}

/// CI system settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiSettings {
    /// `owner/repo`. No repository means simulated mode in `auto`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Branch the workflow is dispatched on.
    pub branch: String,
    /// Workflow file name or id.
    pub workflow: String,
    /// API token. Never printed.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for CiSettings {
    fn default() -> Self {
        Self {
            repository: None,
            branch: DEFAULT_BRANCH.to_string(),
            workflow: DEFAULT_WORKFLOW.to_string(),
            token: None,
        }
    }
}

/// Validated CI credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiCredentials {
    pub repository: String,
    pub token: String,
}

impl CiSettings {
    /// Configured token, falling back to `GITHUB_TOKEN`.
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| env::var(GITHUB_TOKEN_ENV_VAR).ok())
            .filter(|token| !token.trim().is_empty())
    }

    /// `Ok(None)` when no repository is configured at all; an error when one
    /// is configured but unusable.
    pub fn credentials(&self) -> Result<Option<CiCredentials>, ConfigurationError> {
        let Some(repository) = self.repository.as_deref().filter(|r| !r.trim().is_empty()) else {
            return Ok(None);
        };
        parse_repository(repository)?;
        let token = self
            .resolved_token()
            .ok_or_else(|| ConfigurationError::MissingToken {
                repository: repository.to_string(),
            })?;
        Ok(Some(CiCredentials {
            repository: repository.trim().to_string(),
            token,
        }))
    }
}

/// Where the coordinator finds the result relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Relay base URL. Without it only CI polling and simulation are available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Callback URL handed to CI; derived from `base_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl BackendSettings {
    /// Effective callback URL.
    pub fn callback_url(&self) -> Option<String> {
        self.callback_url.clone().or_else(|| {
            self.base_url
                .as_deref()
                .map(|base| format!("{}/api/webhook/results", base.trim_end_matches('/')))
        })
    }
}

/// Result relay server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Listen address.
    pub bind: String,
    /// Shared secret for webhook signatures. Never printed.
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    /// How long stored results are kept.
    pub retention_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            webhook_secret: None,
            retention_secs: 3600,
        }
    }
}

/// Timeouts in configuration-friendly units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub primary_wait_secs: u64,
    pub outer_deadline_secs: u64,
    pub result_grace_secs: u64,
    pub probe_timeout_ms: u64,
    pub backend_poll_interval_ms: u64,
    pub backend_retry_attempts: u32,
    pub backend_retry_backoff_ms: u64,
    pub store_retry_backoff_ms: u64,
    pub ci_poll_interval_secs: u64,
    pub ci_max_consecutive_errors: u32,
    pub simulation_delay_ms: u64,
    pub run_lookup_attempts: u32,
    pub run_lookup_interval_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for TimeoutSettings {
    fn from(config: &TimeoutConfig) -> Self {
        let millis = |d: Duration| d.as_millis() as u64;
        Self {
            primary_wait_secs: config.primary_wait.as_secs(),
            outer_deadline_secs: config.outer_deadline.as_secs(),
            result_grace_secs: config.result_grace.as_secs(),
            probe_timeout_ms: millis(config.probe_timeout),
            backend_poll_interval_ms: millis(config.backend_poll_interval),
            backend_retry_attempts: config.backend_retry_attempts,
            backend_retry_backoff_ms: millis(config.backend_retry_backoff),
            store_retry_backoff_ms: millis(config.store_retry_backoff),
            ci_poll_interval_secs: config.ci_poll_interval.as_secs(),
            ci_max_consecutive_errors: config.ci_max_consecutive_errors,
            simulation_delay_ms: millis(config.simulation_delay),
            run_lookup_attempts: config.run_lookup_attempts,
            run_lookup_interval_ms: millis(config.run_lookup_interval),
        }
    }
}

impl From<&TimeoutSettings> for TimeoutConfig {
    fn from(settings: &TimeoutSettings) -> Self {
        TimeoutConfig::new()
            .with_primary_wait(Duration::from_secs(settings.primary_wait_secs))
            .with_outer_deadline(Duration::from_secs(settings.outer_deadline_secs))
            .with_result_grace(Duration::from_secs(settings.result_grace_secs))
            .with_probe_timeout(Duration::from_millis(settings.probe_timeout_ms))
            .with_backend_poll_interval(Duration::from_millis(settings.backend_poll_interval_ms))
            .with_backend_retry(
                settings.backend_retry_attempts,
                Duration::from_millis(settings.backend_retry_backoff_ms),
            )
            .with_store_retry_backoff(Duration::from_millis(settings.store_retry_backoff_ms))
            .with_ci_poll_interval(Duration::from_secs(settings.ci_poll_interval_secs))
            .with_ci_max_consecutive_errors(settings.ci_max_consecutive_errors)
            .with_simulation_delay(Duration::from_millis(settings.simulation_delay_ms))
            .with_run_lookup(
                settings.run_lookup_attempts,
                Duration::from_millis(settings.run_lookup_interval_ms),
            )
    }
}

impl Settings {
    /// Load settings from `path` (required) or the default file (optional),
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with(path, Self::environment())
    }

    /// Environment override source with the `TESTRELAY__` prefix.
    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self, ConfigurationError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::from(Path::new(DEFAULT_CONFIG_FILE))
                .format(FileFormat::Toml)
                .required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Timeouts as used at runtime.
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::from(&self.timeouts)
    }

    /// Render as TOML, secrets omitted.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
