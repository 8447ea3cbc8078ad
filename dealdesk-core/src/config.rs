//! Client configuration.
//!
//! Loaded from a TOML file (`--config <path>` or `DEALDESK_CONFIG`), then
//! overridden by `DEALDESK_*` environment variables. Values are per-call
//! defaults for the query layer; nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Query cache defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// How long a fetched value counts as fresh.
    pub stale_time_ms: u64,
    /// How long an unobserved entry survives before eviction.
    pub gc_time_ms: u64,
    /// Period of the background garbage collection task.
    pub gc_interval_ms: u64,
}

impl QueryConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 0,
            gc_time_ms: 5 * 60 * 1000,
            gc_interval_ms: 60 * 1000,
        }
    }
}

/// Read-path retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

/// Mutation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationConfig {
    /// Run the invalidation fan-out after a failed write as well.
    pub invalidate_on_error: bool,
    /// Refetch observed entries when they are invalidated.
    pub refetch_active: bool,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            invalidate_on_error: true,
            refetch_active: true,
        }
    }
}

/// Realtime bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeConfig {
    /// Database schema the change feed reports.
    pub schema: String,
    /// Capacity of the cache event broadcast channel.
    pub event_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            event_buffer: 1024,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

impl ClientConfig {
    /// Load from the path given by `--config` or `DEALDESK_CONFIG`, apply
    /// environment overrides, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let mut config = Self::from_path(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Override individual values from the environment.
    ///
    /// Environment variables:
    /// - `DEALDESK_STALE_TIME_MS`, `DEALDESK_GC_TIME_MS`, `DEALDESK_GC_INTERVAL_MS`
    /// - `DEALDESK_MAX_RETRIES`, `DEALDESK_INITIAL_BACKOFF_MS`, `DEALDESK_MAX_BACKOFF_MS`
    /// - `DEALDESK_INVALIDATE_ON_ERROR`: "true" or "false"
    /// - `DEALDESK_REALTIME_SCHEMA`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(v) = number("DEALDESK_STALE_TIME_MS") {
            self.query.stale_time_ms = v;
        }
        if let Some(v) = number("DEALDESK_GC_TIME_MS") {
            self.query.gc_time_ms = v;
        }
        if let Some(v) = number("DEALDESK_GC_INTERVAL_MS") {
            self.query.gc_interval_ms = v;
        }
        if let Some(v) = number("DEALDESK_MAX_RETRIES") {
            self.retry.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = number("DEALDESK_INITIAL_BACKOFF_MS") {
            self.retry.initial_backoff_ms = v;
        }
        if let Some(v) = number("DEALDESK_MAX_BACKOFF_MS") {
            self.retry.max_backoff_ms = v;
        }
        if let Some(v) = lookup("DEALDESK_INVALIDATE_ON_ERROR") {
            self.mutation.invalidate_on_error = v.to_lowercase() != "false";
        }
        if let Some(v) = lookup("DEALDESK_REALTIME_SCHEMA") {
            if !v.trim().is_empty() {
                self.realtime.schema = v.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.gc_time_ms == 0 {
            return Err(invalid("query.gc_time_ms", "must be > 0"));
        }
        if self.query.gc_interval_ms == 0 {
            return Err(invalid("query.gc_interval_ms", "must be > 0"));
        }
        if self.retry.initial_backoff_ms == 0 {
            return Err(invalid("retry.initial_backoff_ms", "must be > 0"));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid("retry.max_backoff_ms", "must be >= initial_backoff_ms"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be >= 1.0"));
        }
        if self.realtime.schema.trim().is_empty() {
            return Err(invalid("realtime.schema", "must not be empty"));
        }
        if self.realtime.event_buffer == 0 {
            return Err(invalid("realtime.event_buffer", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("DEALDESK_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
