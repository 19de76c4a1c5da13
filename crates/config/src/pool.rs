//! Pool-wide configuration.

use duration_str::deserialize_duration;
use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs for a dispatcher pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of requests waiting in the queue before new
    /// submissions are refused.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Default maximum time a request may wait in the queue before it is
    /// failed. Overridable per call.
    #[serde(default = "default_max_wait", deserialize_with = "deserialize_duration")]
    pub max_wait: Duration,

    /// Maximum number of keys tried for a single request. Defaults to the
    /// number of registered keys at dispatch time.
    #[serde(default)]
    pub max_retries: Option<usize>,

    /// Consecutive failures after which a key's circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit stays open before a probe is allowed.
    #[serde(default = "default_reset_timeout", deserialize_with = "deserialize_duration")]
    pub reset_timeout: Duration,

    /// Quota usage fraction at which the warning hook fires, in (0, 1].
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// How long a key is shelved after a rate-limited response that carried
    /// no retry-after signal.
    #[serde(default = "default_rate_limit_backoff", deserialize_with = "deserialize_duration")]
    pub rate_limit_backoff: Duration,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_warning_threshold() -> f64 {
    0.8
}

fn default_rate_limit_backoff() -> Duration {
    Duration::from_secs(60)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_wait: default_max_wait(),
            max_retries: None,
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            warning_threshold: default_warning_threshold(),
            rate_limit_backoff: default_rate_limit_backoff(),
        }
    }
}

impl PoolConfig {
    /// Validate pool-wide settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be a positive integer".to_string());
        }

        if self.failure_threshold == 0 {
            return Err("failure_threshold must be a positive integer".to_string());
        }

        if self.warning_threshold <= 0.0 || self.warning_threshold > 1.0 {
            return Err(format!(
                "warning_threshold must be in (0, 1], got {}",
                self.warning_threshold
            ));
        }

        Ok(())
    }
}
