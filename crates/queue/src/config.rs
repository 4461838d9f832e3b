//! Queue configuration.
//!
//! Host apps either deserialize [`QueueConfig`] from their own settings file
//! or call [`QueueConfig::from_env`]. Durations are carried as milliseconds so
//! the serialized form stays flat.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use memsync_core::CoreError;

use crate::backoff::BackoffPolicy;
use crate::classifier::{DEFAULT_RETRYABLE_CLIENT_CODES, ErrorClassifier};

/// Configuration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid backoff policy: {0}")]
    Backoff(#[from] CoreError),
}

/// Retry section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the 1st, 2nd, ... failure; the last value repeats.
    pub delays_ms: Vec<u64>,
    /// Dead-letter after this many attempts (`None` = retry forever).
    pub max_attempts: Option<u32>,
    /// Stricter ceiling for unclassified failures.
    pub max_unknown_attempts: u32,
    /// 4xx codes treated as transient.
    pub retryable_client_codes: Vec<u16>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delays_ms: vec![5_000, 30_000, 120_000],
            max_attempts: Some(5),
            max_unknown_attempts: 3,
            retryable_client_codes: DEFAULT_RETRYABLE_CLIENT_CODES.to_vec(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> Result<BackoffPolicy, ConfigError> {
        let delays = self.delays_ms.iter().copied().map(Duration::from_millis).collect();
        let policy = BackoffPolicy::new(delays, self.max_attempts)?
            .with_max_unknown_attempts(self.max_unknown_attempts)?;
        Ok(policy)
    }

    pub fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new(self.retryable_client_codes.clone())
    }
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deadline for a single remote write.
    pub attempt_timeout_ms: u64,
    /// Period of the background drain timer.
    pub tick_interval_ms: u64,
    /// Ready entries fetched per drain cycle.
    pub batch_size: usize,
    /// Cycles one drain may run back-to-back before yielding to the timer.
    pub max_cycles_per_drain: u32,
    /// Window an online transition must hold before it wakes the queue.
    pub connectivity_debounce_ms: u64,
    pub backoff: BackoffConfig,
    /// SQLite file; `None` uses the platform data directory.
    pub database_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 15_000,
            tick_interval_ms: 30_000,
            batch_size: 64,
            max_cycles_per_drain: 8,
            connectivity_debounce_ms: 2_000,
            backoff: BackoffConfig::default(),
            database_path: None,
        }
    }
}

impl QueueConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_millis(self.connectivity_debounce_ms)
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_connectivity_debounce(mut self, debounce: Duration) -> Self {
        self.connectivity_debounce_ms = duration_ms(debounce);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_cycles_per_drain(mut self, max: u32) -> Self {
        self.max_cycles_per_drain = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Check value ranges and that the backoff section builds a policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout_ms == 0 {
            return Err(invalid("attempt_timeout_ms", "0", "must be positive"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "0", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "0", "must be positive"));
        }
        if self.max_cycles_per_drain == 0 {
            return Err(invalid("max_cycles_per_drain", "0", "must be positive"));
        }
        self.backoff.policy()?;
        Ok(())
    }

    /// Load from `MEMSYNC_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment, in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("MEMSYNC_ATTEMPT_TIMEOUT_MS") {
            config.attempt_timeout_ms = parse_num("MEMSYNC_ATTEMPT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_TICK_INTERVAL_MS") {
            config.tick_interval_ms = parse_num("MEMSYNC_TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_BATCH_SIZE") {
            config.batch_size = parse_num("MEMSYNC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_MAX_CYCLES_PER_DRAIN") {
            config.max_cycles_per_drain = parse_num("MEMSYNC_MAX_CYCLES_PER_DRAIN", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_CONNECTIVITY_DEBOUNCE_MS") {
            config.connectivity_debounce_ms = parse_num("MEMSYNC_CONNECTIVITY_DEBOUNCE_MS", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_BACKOFF_DELAYS_MS") {
            config.backoff.delays_ms = parse_list("MEMSYNC_BACKOFF_DELAYS_MS", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_MAX_ATTEMPTS") {
            config.backoff.max_attempts = match v.trim() {
                "" | "none" | "unlimited" => None,
                other => Some(parse_num("MEMSYNC_MAX_ATTEMPTS", other)?),
            };
        }
        if let Some(v) = lookup("MEMSYNC_MAX_UNKNOWN_ATTEMPTS") {
            config.backoff.max_unknown_attempts = parse_num("MEMSYNC_MAX_UNKNOWN_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("MEMSYNC_RETRYABLE_CLIENT_CODES") {
            config.backoff.retryable_client_codes =
                parse_list("MEMSYNC_RETRYABLE_CLIENT_CODES", &v)?;
        }
        match lookup("MEMSYNC_DB_PATH") {
            Some(v) if !v.trim().is_empty() => config.database_path = Some(PathBuf::from(v.trim())),
            _ => tracing::debug!("MEMSYNC_DB_PATH not set; using platform data directory"),
        }

        config.validate()?;
        Ok(config)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_num<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(key, value, e.to_string()))
}

fn parse_list<T>(key: &'static str, value: &str) -> Result<Vec<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_num(key, s))
        .collect()
}
