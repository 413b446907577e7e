use std::str::FromStr;
use std::time::Duration;

use atelier_core::generation::ParameterRules;
use validator::Validate;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct EngineConfig {
    /// Upper bound on concurrently Running jobs.
    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent: usize,
    /// Interval between status checks of the polling reporter.
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// Events a callback subscriber may lag behind before a stalled
    /// callback gets it detached.
    #[validate(range(min = 1, max = 65536))]
    pub subscriber_buffer: usize,
    /// How long a single callback may run before its subscriber counts as
    /// stalled.
    #[validate(range(min = 1))]
    pub subscriber_stall_ms: u64,
    /// Broadcast buffer for async event receivers.
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,
    /// How long shutdown waits for each reporter task.
    pub shutdown_timeout_secs: u64,
    /// Enforce the per-kind required parameters at submission.
    pub strict_parameters: bool,
}

/// Errors from loading or validating [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            poll_interval_ms: 1000,
            subscriber_buffer: 64,
            subscriber_stall_ms: 2000,
            event_channel_capacity: 1024,
            shutdown_timeout_secs: 5,
            strict_parameters: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `MAX_CONCURRENT_JOBS`    | `1`     |
    /// | `POLL_INTERVAL_MS`       | `1000`  |
    /// | `SUBSCRIBER_BUFFER`      | `64`    |
    /// | `SUBSCRIBER_STALL_MS`    | `2000`  |
    /// | `EVENT_CHANNEL_CAPACITY` | `1024`  |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `5`     |
    /// | `STRICT_PARAMETERS`      | `false` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_concurrent: parse_var(&lookup, "MAX_CONCURRENT_JOBS", defaults.max_concurrent)?,
            poll_interval_ms: parse_var(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            subscriber_buffer: parse_var(&lookup, "SUBSCRIBER_BUFFER", defaults.subscriber_buffer)?,
            subscriber_stall_ms: parse_var(
                &lookup,
                "SUBSCRIBER_STALL_MS",
                defaults.subscriber_stall_ms,
            )?,
            event_channel_capacity: parse_var(
                &lookup,
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            )?,
            shutdown_timeout_secs: parse_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            strict_parameters: parse_var(&lookup, "STRICT_PARAMETERS", defaults.strict_parameters)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn subscriber_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_stall_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn parameter_rules(&self) -> ParameterRules {
        if self.strict_parameters {
            ParameterRules::Strict
        } else {
            ParameterRules::Structural
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
