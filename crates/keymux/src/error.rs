//! Error types surfaced by the dispatcher facade.

use std::time::Duration;

/// Opaque error type produced by a caller's request function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors a dispatcher operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The request queue is at capacity.
    #[error("Request queue is full ({queue_size}/{max_queue_size})")]
    QueueFull {
        /// Number of requests currently queued.
        queue_size: usize,
        /// Configured queue capacity.
        max_queue_size: usize,
        /// Suggested time to wait before resubmitting.
        retry_after: Duration,
    },

    /// The request waited in the queue longer than its deadline allowed.
    #[error("Request timed out after waiting {waited:?} in queue")]
    QueueTimeout {
        /// How long the request waited before being failed.
        waited: Duration,
        /// Suggested time to wait before resubmitting.
        retry_after: Duration,
        /// Number of requests still queued when this one was failed.
        queue_size: usize,
    },

    /// No key was eligible for the request.
    #[error(
        "All keys exhausted: {exhausted_keys} over quota, {circuit_open_keys} circuit-open, \
         {rate_limited_keys} rate-limited out of {total_keys}"
    )]
    AllKeysExhausted {
        /// Total number of registered keys.
        total_keys: usize,
        /// Keys with no quota remaining.
        exhausted_keys: usize,
        /// Keys with an open circuit.
        circuit_open_keys: usize,
        /// Keys in a rate-limit window or out of tokens.
        rate_limited_keys: usize,
        /// Earliest time any key is expected to become available.
        retry_after: Duration,
    },

    /// A key configuration was rejected.
    #[error("Invalid configuration for key '{key_id}': {reason}")]
    InvalidKeyConfig {
        /// The offending key id.
        key_id: String,
        /// Why the configuration was refused.
        reason: String,
    },

    /// A pool-wide setting was rejected.
    #[error("Invalid pool configuration: {reason}")]
    InvalidPoolConfig {
        /// Why the configuration was refused.
        reason: String,
    },

    /// The pool was constructed without any keys.
    #[error("No keys configured")]
    NoKeysConfigured,

    /// An operator control referenced an unknown key id.
    #[error("Key '{0}' not found")]
    KeyNotFound(String),

    /// The pool has been shut down.
    #[error("Dispatcher is shut down")]
    Shutdown,

    /// The caller's request function failed on every attempted key; this is
    /// the last error it produced.
    #[error("Upstream request failed: {0}")]
    Upstream(BoxError),
}

impl PoolError {
    /// The suggested wait before retrying, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QueueFull { retry_after, .. }
            | Self::QueueTimeout { retry_after, .. }
            | Self::AllKeysExhausted { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_carried_by_backpressure_errors() {
        let err = PoolError::QueueFull {
            queue_size: 10,
            max_queue_size: 10,
            retry_after: Duration::from_secs(10),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));

        let err = PoolError::AllKeysExhausted {
            total_keys: 2,
            exhausted_keys: 1,
            circuit_open_keys: 1,
            rate_limited_keys: 0,
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        assert_eq!(PoolError::NoKeysConfigured.retry_after(), None);
        assert_eq!(PoolError::Shutdown.retry_after(), None);
    }

    #[test]
    fn messages_name_the_key() {
        let err = PoolError::InvalidKeyConfig {
            key_id: "prod-1".to_string(),
            reason: "rps must be a positive number".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("prod-1"));
        assert!(message.contains("rps"));
    }
}
