//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Configuration shared by the engine, scheduler and maintenance sweeps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Lease granted with every workflow or task claim
    #[serde(with = "duration_millis")]
    pub lease: Duration,

    /// How many times a conflicted append is re-planned before giving up
    pub max_conflict_retries: u32,

    /// Retry bound for tasks that do not set their own
    pub default_max_retries: u32,

    /// Queue used when a command or start request names none
    pub default_queue: String,

    /// How long a cancelling workflow waits for its children
    #[serde(with = "duration_millis")]
    pub cancellation_timeout: Duration,

    /// Maximum rows handled per maintenance sweep
    pub sweep_batch_size: usize,

    /// Backoff before a failed task attempt becomes visible again
    pub task_retry: RetryPolicy,

    /// Retry loop around transiently failing store calls
    pub store_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            max_conflict_retries: 8,
            default_max_retries: 3,
            default_queue: "default".to_string(),
            cancellation_timeout: Duration::from_secs(300),
            sweep_batch_size: 100,
            task_retry: RetryPolicy::exponential(),
            store_retry: RetryPolicy::transient(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DURABLE_LEASE_MS`: claim lease (default: 30000)
    /// - `DURABLE_MAX_CONFLICT_RETRIES`: append retries on conflict (default: 8)
    /// - `DURABLE_DEFAULT_MAX_RETRIES`: task retry bound (default: 3)
    /// - `DURABLE_CANCELLATION_TIMEOUT_MS`: child cancellation wait (default: 300000)
    /// - `DURABLE_SWEEP_BATCH_SIZE`: rows per maintenance sweep (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            lease: env_millis("DURABLE_LEASE_MS").unwrap_or(defaults.lease),
            max_conflict_retries: env_parse("DURABLE_MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
            default_max_retries: env_parse("DURABLE_DEFAULT_MAX_RETRIES")
                .unwrap_or(defaults.default_max_retries),
            cancellation_timeout: env_millis("DURABLE_CANCELLATION_TIMEOUT_MS")
                .unwrap_or(defaults.cancellation_timeout),
            sweep_batch_size: env_parse("DURABLE_SWEEP_BATCH_SIZE")
                .unwrap_or(defaults.sweep_batch_size),
            ..defaults
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_cancellation_timeout(mut self, timeout: Duration) -> Self {
        self.cancellation_timeout = timeout;
        self
    }

    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }

    pub fn with_task_retry(mut self, policy: RetryPolicy) -> Self {
        self.task_retry = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

pub(crate) fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_lease(Duration::from_secs(5))
            .with_default_queue("billing")
            .with_sweep_batch_size(0);

        assert_eq!(config.lease, Duration::from_secs(5));
        assert_eq!(config.default_queue, "billing");
        assert_eq!(config.sweep_batch_size, 1);
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let config = EngineConfig::default().with_lease(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease"], 1500);

        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
