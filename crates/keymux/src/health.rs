//! On-demand pool health aggregation.

use std::fmt;
use std::time::Duration;

use jiff::Timestamp;
use tokio::time::Instant;

use crate::circuit::CircuitBreaker;
use crate::quota::QuotaTracker;
use crate::selector;
use crate::state::{CircuitState, Registry};

/// Overall pool health, derived from the fraction of available keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// At least half the keys are available.
    Healthy,
    /// Less than half the keys are available.
    Degraded,
    /// Less than a fifth of the keys are available.
    Critical,
    /// No key is available, or no keys are registered.
    Exhausted,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Exhausted => "exhausted",
        };

        f.write_str(label)
    }
}

/// Why a key deserves operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Usage crossed the warning threshold but the key still has budget.
    QuotaWarning,
    /// The key has no quota left this period.
    QuotaExhausted,
    /// A temporary rate-limit window is active.
    RateLimited,
    /// The circuit is open.
    CircuitOpen,
}

/// A single actionable warning about one key.
#[derive(Debug, Clone)]
pub struct KeyWarning {
    /// The key the warning is about.
    pub key_id: String,
    /// The category; at most one warning per category per key.
    pub kind: WarningKind,
    /// Human-readable description.
    pub message: String,
}

/// Snapshot of pool health.
#[derive(Debug)]
pub struct PoolHealth {
    /// Derived status; see [`HealthStatus`].
    pub status: HealthStatus,
    /// Keys currently passing the availability check.
    pub available_keys: usize,
    /// All registered keys.
    pub total_keys: usize,
    /// Sum of configured rates over currently available keys.
    pub effective_rps: f64,
    /// Sum of quota limits over all bounded keys.
    pub effective_quota_total: u64,
    /// Sum of remaining quota over currently available bounded keys.
    pub effective_quota_remaining: u64,
    /// Per-key warnings, at most one per applicable category.
    pub warnings: Vec<KeyWarning>,
}

pub(crate) fn snapshot(
    registry: &mut Registry,
    quota: &QuotaTracker,
    breaker: &CircuitBreaker,
    now: Instant,
    wall: Timestamp,
) -> PoolHealth {
    let total_keys = registry.len();
    let mut available_keys = 0;
    let mut effective_rps = 0.0;
    let mut effective_quota_total = 0;
    let mut effective_quota_remaining = 0;
    let mut warnings = Vec::new();

    for state in &mut registry.keys {
        if let Some(limit) = state.config.quota.limit() {
            effective_quota_total += limit;
        }

        let available = selector::is_available(state, quota, breaker, now, wall);

        if available {
            available_keys += 1;
            effective_rps += state.config.rps.unwrap_or(0.0);
            effective_quota_remaining += quota.remaining(state).unwrap_or(0);
        }

        let key_id = state.id().to_string();

        if let Some(usage) = quota.usage(state) {
            if usage >= 1.0 {
                warnings.push(KeyWarning {
                    key_id: key_id.clone(),
                    kind: WarningKind::QuotaExhausted,
                    message: format!("key '{key_id}' has no quota remaining"),
                });
            } else if usage >= quota.warning_threshold() {
                warnings.push(KeyWarning {
                    key_id: key_id.clone(),
                    kind: WarningKind::QuotaWarning,
                    message: format!("key '{key_id}' is at {:.0}% of its quota", usage * 100.0),
                });
            }
        }

        if state.in_rate_limit_window(now) {
            let remaining = state
                .rate_limited_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default();

            warnings.push(KeyWarning {
                key_id: key_id.clone(),
                kind: WarningKind::RateLimited,
                message: format!("key '{key_id}' is rate limited for another {}s", remaining.as_secs()),
            });
        }

        if state.circuit == CircuitState::Open {
            let reset = breaker.reset_wait(state, now).unwrap_or(Duration::ZERO);

            warnings.push(KeyWarning {
                key_id: key_id.clone(),
                kind: WarningKind::CircuitOpen,
                message: format!("key '{key_id}' circuit is open, resets in {}s", reset.as_secs()),
            });
        }
    }

    PoolHealth {
        status: status_for(available_keys, total_keys),
        available_keys,
        total_keys,
        effective_rps,
        effective_quota_total,
        effective_quota_remaining,
        warnings,
    }
}

fn status_for(available: usize, total: usize) -> HealthStatus {
    if total == 0 || available == 0 {
        return HealthStatus::Exhausted;
    }

    let ratio = available as f64 / total as f64;

    if ratio < 0.2 {
        HealthStatus::Critical
    } else if ratio < 0.5 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
