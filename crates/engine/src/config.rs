//! Engine configuration.
//!
//! [`EngineConfig`] holds every recognized option. Values missing from a
//! deserialized document fall back to the defaults below; `from_env` overlays
//! `OBJPROC_*` environment variables on those defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix of the environment variables read by [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "OBJPROC_";

/// Configuration or processor-declaration error. Raised at construction/startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("processor declares no pending statuses")]
    NoPendingStatuses,

    #[error("invalid status declaration: {0}")]
    InvalidStatusDeclaration(String),

    #[error("no claim transition declared for pending status {0}")]
    MissingClaimTransition(String),

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Name used for logging, thread names and lock owner tokens.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Worker pool size.
    #[serde(default = "default_processing_thread_count")]
    pub processing_thread_count: usize,

    /// Bound of the work queue (backpressure).
    #[serde(default = "default_maximum_queue_length")]
    pub maximum_queue_length: usize,

    /// Objects requested per claim call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Age after which a held lock is considered abandoned.
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,

    /// Per-call timeout of `process()` (best effort).
    #[serde(default = "default_processing_timeout_millis")]
    pub processing_timeout_millis: u64,

    /// Retry ceiling when the processor does not declare its own.
    #[serde(default = "default_maximum_processing_attempts")]
    pub maximum_processing_attempts: u32,

    /// Backoff applied when the processor leaves the retry delay to the engine.
    #[serde(default = "default_retry_delay_millis")]
    pub retry_delay_millis: u64,

    /// Driver polling cadence.
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,

    /// Bounded wait for in-flight work on `stop()`.
    #[serde(default = "default_shutdown_timeout_millis")]
    pub shutdown_timeout_millis: u64,

    /// PROCESSING-phase steps allowed within a single claim.
    #[serde(default = "default_max_chained_steps")]
    pub max_chained_steps: u32,

    /// Revert PROCESSING objects left over from a crash when starting.
    #[serde(default = "default_reset_stale_locks_on_start")]
    pub reset_stale_locks_on_start: bool,
}

fn default_instance_name() -> String {
    "objproc".to_string()
}

fn default_processing_thread_count() -> usize {
    4
}

fn default_maximum_queue_length() -> usize {
    100
}

fn default_batch_size() -> usize {
    20
}

fn default_lock_timeout_seconds() -> u64 {
    600
}

fn default_processing_timeout_millis() -> u64 {
    60_000
}

fn default_maximum_processing_attempts() -> u32 {
    3
}

fn default_retry_delay_millis() -> u64 {
    10_000
}

fn default_poll_interval_millis() -> u64 {
    1_000
}

fn default_shutdown_timeout_millis() -> u64 {
    30_000
}

fn default_max_chained_steps() -> u32 {
    32
}

fn default_reset_stale_locks_on_start() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            processing_thread_count: default_processing_thread_count(),
            maximum_queue_length: default_maximum_queue_length(),
            batch_size: default_batch_size(),
            lock_timeout_seconds: default_lock_timeout_seconds(),
            processing_timeout_millis: default_processing_timeout_millis(),
            maximum_processing_attempts: default_maximum_processing_attempts(),
            retry_delay_millis: default_retry_delay_millis(),
            poll_interval_millis: default_poll_interval_millis(),
            shutdown_timeout_millis: default_shutdown_timeout_millis(),
            max_chained_steps: default_max_chained_steps(),
            reset_stale_locks_on_start: default_reset_stale_locks_on_start(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `OBJPROC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).filter(|v| !v.trim().is_empty()).map(|v| (key, v))
        };

        if let Some((_, v)) = var("INSTANCE_NAME") {
            config.instance_name = v.trim().to_string();
        }
        if let Some((k, v)) = var("PROCESSING_THREAD_COUNT") {
            config.processing_thread_count = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("MAXIMUM_QUEUE_LENGTH") {
            config.maximum_queue_length = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("BATCH_SIZE") {
            config.batch_size = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("LOCK_TIMEOUT_SECONDS") {
            config.lock_timeout_seconds = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("PROCESSING_TIMEOUT_MILLIS") {
            config.processing_timeout_millis = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("MAXIMUM_PROCESSING_ATTEMPTS") {
            config.maximum_processing_attempts = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("RETRY_DELAY_MILLIS") {
            config.retry_delay_millis = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("POLL_INTERVAL_MILLIS") {
            config.poll_interval_millis = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("SHUTDOWN_TIMEOUT_MILLIS") {
            config.shutdown_timeout_millis = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("MAX_CHAINED_STEPS") {
            config.max_chained_steps = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("RESET_STALE_LOCKS_ON_START") {
            config.reset_stale_locks_on_start = parse(&k, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.trim().is_empty() || self.instance_name.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "instance_name",
                "must be non-empty and contain no whitespace",
            ));
        }
        let positive: [(&str, u64); 6] = [
            ("processing_thread_count", self.processing_thread_count as u64),
            ("maximum_queue_length", self.maximum_queue_length as u64),
            ("batch_size", self.batch_size as u64),
            ("processing_timeout_millis", self.processing_timeout_millis),
            ("maximum_processing_attempts", u64::from(self.maximum_processing_attempts)),
            ("max_chained_steps", u64::from(self.max_chained_steps)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.lock_timeout_seconds == 0 || chrono::Duration::from_std(self.lock_timeout()).is_err() {
            return Err(ConfigError::invalid(
                "lock_timeout_seconds",
                "must be greater than zero and representable as a timestamp offset",
            ));
        }
        // Each persisted step refreshes the lock, so one step must end before it goes stale.
        if self.processing_timeout() >= self.lock_timeout() {
            return Err(ConfigError::invalid(
                "processing_timeout_millis",
                format!(
                    "must be shorter than the lock timeout ({}s)",
                    self.lock_timeout_seconds
                ),
            ));
        }
        Ok(())
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_processing_thread_count(mut self, count: usize) -> Self {
        self.processing_thread_count = count;
        self
    }

    pub fn with_maximum_queue_length(mut self, length: usize) -> Self {
        self.maximum_queue_length = length;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_seconds = timeout.as_secs();
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout_millis = millis(timeout);
        self
    }

    pub fn with_maximum_processing_attempts(mut self, attempts: u32) -> Self {
        self.maximum_processing_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_millis = millis(delay);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_millis = millis(interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_millis = millis(timeout);
        self
    }

    pub fn with_max_chained_steps(mut self, steps: u32) -> Self {
        self.max_chained_steps = steps;
        self
    }

    pub fn with_reset_stale_locks_on_start(mut self, reset: bool) -> Self {
        self.reset_stale_locks_on_start = reset;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_millis)
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
