//! Tracing subscriber setup.

use dealdesk_core::{ConfigError, DealDeskResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "DEALDESK_LOG";
/// Environment variable selecting the output format (`json` or `text`).
pub const LOG_FORMAT_ENV: &str = "DEALDESK_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `dealdesk_query=debug,info`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            json: std::env::var(LOG_FORMAT_ENV)
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> DealDeskResult<EnvFilter> {
        EnvFilter::try_new(&self.filter).map_err(|e| {
            ConfigError::InvalidValue {
                field: LOG_ENV.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> DealDeskResult<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ConfigError::InvalidValue {
        field: "tracing".to_string(),
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    Ok(())
}
