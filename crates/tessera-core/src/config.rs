// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Configuration management for Tessera.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rules::MigrationRule;
use crate::types::BackendDescriptor;

/// Default maximum number of dispatch attempts per intent.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 100;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default per-call timeout in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default bounded wait for a synchronous submit, in milliseconds.
pub const DEFAULT_SYNC_WAIT_MS: u64 = 5_000;

/// Default health probe interval in milliseconds.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 5_000;

/// Main configuration for the Tessera storage manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Write-ahead log configuration.
    pub wal: WalConfig,
    /// Dispatcher retry and concurrency configuration.
    pub dispatch: DispatchConfig,
    /// Backend health tracking configuration.
    pub health: HealthConfig,
    /// Routing policy configuration.
    pub policy: PolicyConfig,
    /// Statically configured backends.
    pub backends: Vec<BackendDescriptor>,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or fails validation.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(
            wal_dir = %config.wal.dir.display(),
            backends = config.backends.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Checks every section for impossible values.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        self.wal.validate()?;
        self.dispatch.validate()?;
        self.health.validate()?;
        self.policy.validate()?;

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigValidationError::EmptyBackendName.into());
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigValidationError::DuplicateBackend(backend.name.clone()).into());
            }
            if backend.max_concurrency == Some(0) {
                return Err(ConfigValidationError::InvalidConcurrency.into());
            }
        }
        Ok(())
    }
}

/// Write-Ahead Log (WAL) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding the log segments.
    pub dir: PathBuf,
    /// Sync mode for log appends.
    pub sync_mode: WalSyncMode,
    /// How long terminal entries stay queryable before compaction may
    /// reclaim them, in seconds.
    pub retention_secs: u64,
    /// Interval between background compaction passes in seconds (0 disables
    /// the background loop).
    pub compaction_interval_secs: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            sync_mode: WalSyncMode::Fdatasync,
            retention_secs: 24 * 60 * 60,
            compaction_interval_secs: 5 * 60,
        }
    }
}

impl WalConfig {
    /// Configuration for maximum durability.
    #[must_use]
    pub fn durable() -> Self {
        Self { sync_mode: WalSyncMode::Fsync, ..Default::default() }
    }

    /// Sets the log directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub fn sync_mode(mut self, mode: WalSyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets the retention horizon for terminal entries.
    #[must_use]
    pub fn retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Sets the compaction interval (0 disables background compaction).
    #[must_use]
    pub fn compaction_interval_secs(mut self, secs: u64) -> Self {
        self.compaction_interval_secs = secs;
        self
    }

    /// Retention horizon as a duration.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Compaction interval, or `None` when background compaction is off.
    #[must_use]
    pub fn compaction_interval(&self) -> Option<Duration> {
        (self.compaction_interval_secs > 0)
            .then(|| Duration::from_secs(self.compaction_interval_secs))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory is empty.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::EmptyWalDir);
        }
        Ok(())
    }
}

/// WAL sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// No explicit sync, rely on OS flush.
    None,
    /// Use fdatasync (faster, doesn't sync file metadata).
    #[default]
    Fdatasync,
    /// Use full fsync (slower, syncs all metadata).
    Fsync,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of attempts per intent, counted across restarts.
    pub retry_budget: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Random jitter applied to each backoff, as a fraction in `[0, 1)`.
    pub jitter: f64,
    /// Timeout for a single adapter call in milliseconds.
    pub call_timeout_ms: u64,
    /// How long a synchronous submit waits for the outcome before handing
    /// back a pending handle, in milliseconds.
    pub sync_wait_ms: u64,
    /// Maximum number of adapter calls in flight across all backends.
    pub global_concurrency: usize,
    /// Default maximum number of calls in flight per backend.
    pub per_backend_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter: 0.2,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            sync_wait_ms: DEFAULT_SYNC_WAIT_MS,
            global_concurrency: 64,
            per_backend_concurrency: 8,
        }
    }
}

impl DispatchConfig {
    /// Creates a dispatch configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the backoff base and ceiling.
    #[must_use]
    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.base_backoff_ms = base;
        self.max_backoff_ms = max;
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Sets the bounded wait for synchronous submits.
    #[must_use]
    pub fn sync_wait_ms(mut self, wait_ms: u64) -> Self {
        self.sync_wait_ms = wait_ms;
        self
    }

    /// Sets the global and default per-backend concurrency limits.
    #[must_use]
    pub fn concurrency(mut self, global: usize, per_backend: usize) -> Self {
        self.global_concurrency = global;
        self.per_backend_concurrency = per_backend;
        self
    }

    /// Per-call timeout as a duration.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Bounded submit wait as a duration.
    #[must_use]
    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any limit is zero or the backoff range is inverted.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.retry_budget == 0 {
            return Err(ConfigValidationError::InvalidRetryBudget);
        }
        if self.base_backoff_ms == 0 || self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigValidationError::InvalidBackoff);
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigValidationError::InvalidJitter);
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidTimeout);
        }
        if self.global_concurrency == 0 || self.per_backend_concurrency == 0 {
            return Err(ConfigValidationError::InvalidConcurrency);
        }
        Ok(())
    }
}

/// Backend health tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between active probes in milliseconds.
    pub probe_interval_ms: u64,
    /// Timeout for a single probe in milliseconds.
    pub probe_timeout_ms: u64,
    /// Number of trailing samples kept per backend.
    pub window_size: usize,
    /// Samples required before the error-rate threshold applies.
    pub min_samples: usize,
    /// Consecutive failures that demote a healthy backend to degraded.
    pub degraded_after_failures: u32,
    /// Further consecutive failures that demote a degraded backend to
    /// unreachable.
    pub unreachable_after_failures: u32,
    /// Window error rate above which a healthy backend is degraded.
    pub error_rate_threshold: f64,
    /// Time since the last failure before a success may promote a backend,
    /// in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: 2_000,
            window_size: 20,
            min_samples: 5,
            degraded_after_failures: 3,
            unreachable_after_failures: 3,
            error_rate_threshold: 0.5,
            cooldown_ms: 10_000,
        }
    }
}

impl HealthConfig {
    /// Creates a health configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the probe interval and timeout.
    #[must_use]
    pub fn probe_ms(mut self, interval: u64, timeout: u64) -> Self {
        self.probe_interval_ms = interval;
        self.probe_timeout_ms = timeout;
        self
    }

    /// Sets the trailing window size and the minimum sample count.
    #[must_use]
    pub fn window(mut self, size: usize, min_samples: usize) -> Self {
        self.window_size = size;
        self.min_samples = min_samples;
        self
    }

    /// Sets the consecutive-failure thresholds.
    #[must_use]
    pub fn failure_thresholds(mut self, degraded: u32, unreachable: u32) -> Self {
        self.degraded_after_failures = degraded;
        self.unreachable_after_failures = unreachable;
        self
    }

    /// Sets the error-rate threshold.
    #[must_use]
    pub fn error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    /// Sets the promotion cool-down.
    #[must_use]
    pub fn cooldown_ms(mut self, cooldown: u64) -> Self {
        self.cooldown_ms = cooldown;
        self
    }

    /// Probe interval as a duration.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Promotion cool-down as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for zero intervals, an empty window or thresholds
    /// that can never trigger.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.probe_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidTimeout);
        }
        if self.window_size == 0 || self.min_samples > self.window_size {
            return Err(ConfigValidationError::InvalidWindow);
        }
        if self.degraded_after_failures == 0 || self.unreachable_after_failures == 0 {
            return Err(ConfigValidationError::InvalidFailureThreshold);
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(ConfigValidationError::InvalidErrorRate);
        }
        Ok(())
    }
}

/// Routing policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Backend used when no hint or rule selects one.
    pub default_backend: Option<String>,
    /// Migration rules, in declaration order.
    pub rules: Vec<MigrationRule>,
}

impl PolicyConfig {
    /// Sets the default backend.
    #[must_use]
    pub fn default_backend(mut self, name: impl Into<String>) -> Self {
        self.default_backend = Some(name.into());
        self
    }

    /// Appends a migration rule.
    #[must_use]
    pub fn rule(mut self, rule: MigrationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule has an empty name or target.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for rule in &self.rules {
            if rule.name.is_empty() || rule.target.is_empty() {
                return Err(ConfigValidationError::InvalidRule(rule.name.clone()));
            }
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// The WAL directory is empty.
    #[error("wal directory must not be empty")]
    EmptyWalDir,

    /// Retry budget must be at least 1.
    #[error("retry budget must be at least 1")]
    InvalidRetryBudget,

    /// Backoff base must be positive and not above the ceiling.
    #[error("backoff base must be positive and not exceed the maximum backoff")]
    InvalidBackoff,

    /// Jitter must be a fraction in `[0, 1)`.
    #[error("jitter must be in [0, 1)")]
    InvalidJitter,

    /// Timeout must be positive.
    #[error("timeout must be positive")]
    InvalidTimeout,

    /// Concurrency limits must be at least 1.
    #[error("concurrency limits must be at least 1")]
    InvalidConcurrency,

    /// The health window is empty or smaller than the minimum sample count.
    #[error("health window must be non-empty and hold at least min_samples samples")]
    InvalidWindow,

    /// Failure thresholds must be at least 1.
    #[error("failure thresholds must be at least 1")]
    InvalidFailureThreshold,

    /// Error-rate threshold must be in `(0, 1]`.
    #[error("error rate threshold must be in (0, 1]")]
    InvalidErrorRate,

    /// A migration rule has an empty name or target.
    #[error("migration rule '{0}' must have a name and a target")]
    InvalidRule(String),

    /// A backend has an empty name.
    #[error("backend name must not be empty")]
    EmptyBackendName,

    /// Two backends share a name.
    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),
}

impl From<ConfigValidationError> for crate::Error {
    fn from(err: ConfigValidationError) -> Self {
        Self::Config(err.to_string())
    }
}
