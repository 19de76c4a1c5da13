//! Weighted round-robin key selection.
//!
//! The registry's keys are expanded into a weighted sequence (each key
//! appears `weight` times, in registration order) and a cursor walks it.
//! Selection scans at most one full revolution from the cursor, skipping
//! keys the current request already tried and keys that are not available,
//! and parks the cursor just past the winner.

use std::collections::HashSet;
use std::time::Duration;

use jiff::Timestamp;
use tokio::time::Instant;

use crate::circuit::CircuitBreaker;
use crate::quota::QuotaTracker;
use crate::rate_limiter;
use crate::state::{CircuitState, KeyState, Registry};

/// Wait to suggest when no key offers a concrete availability signal.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Why keys are out of rotation, each key counted once. Precedence when
/// several conditions hold: circuit, then quota, then rate limit.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AvailabilityBreakdown {
    pub available: usize,
    pub rate_limited: usize,
    pub quota_exhausted: usize,
    pub circuit_open: usize,
}

/// A key is available iff its circuit is not open, quota remains, the
/// bucket holds a token and no temporary rate-limit window is active.
pub(crate) fn is_available(
    state: &mut KeyState,
    quota: &QuotaTracker,
    breaker: &CircuitBreaker,
    now: Instant,
    wall: Timestamp,
) -> bool {
    if breaker.current_state(state, now) == CircuitState::Open {
        return false;
    }

    if !quota.has_quota(state, wall) {
        return false;
    }

    if !rate_limiter::has_capacity(state, now) {
        return false;
    }

    !state.in_rate_limit_window(now)
}

/// Pick the next eligible key, excluding ids already tried for this
/// request. Returns its index in the registry.
pub(crate) fn select(
    registry: &mut Registry,
    excluded: &HashSet<String>,
    quota: &QuotaTracker,
    breaker: &CircuitBreaker,
    now: Instant,
    wall: Timestamp,
) -> Option<usize> {
    let sequence: Vec<usize> = registry
        .keys
        .iter()
        .enumerate()
        .flat_map(|(index, key)| std::iter::repeat_n(index, key.config.weight as usize))
        .collect();

    if sequence.is_empty() {
        return None;
    }

    let len = sequence.len();
    let start = registry.cursor % len;

    for step in 0..len {
        let position = (start + step) % len;
        let index = sequence[position];

        if excluded.contains(registry.keys[index].id()) {
            continue;
        }

        if !is_available(&mut registry.keys[index], quota, breaker, now, wall) {
            continue;
        }

        registry.cursor = (position + 1) % len;
        log::trace!("selected key '{}'", registry.keys[index].id());
        return Some(index);
    }

    None
}

/// Classify every key into exactly one availability bucket.
pub(crate) fn breakdown(
    registry: &mut Registry,
    quota: &QuotaTracker,
    breaker: &CircuitBreaker,
    now: Instant,
    wall: Timestamp,
) -> AvailabilityBreakdown {
    let mut counts = AvailabilityBreakdown::default();

    for state in &mut registry.keys {
        if breaker.current_state(state, now) == CircuitState::Open {
            counts.circuit_open += 1;
        } else if !quota.has_quota(state, wall) {
            counts.quota_exhausted += 1;
        } else if state.in_rate_limit_window(now) || !rate_limiter::has_capacity(state, now) {
            counts.rate_limited += 1;
        } else {
            counts.available += 1;
        }
    }

    counts
}

/// Earliest time any key is expected to come back: the minimum over circuit
/// resets, token refills and temporary rate-limit windows. Falls back to a
/// flat 60s when nothing gives a signal.
pub(crate) fn next_available(registry: &Registry, breaker: &CircuitBreaker, now: Instant) -> Duration {
    let mut earliest: Option<Duration> = None;

    let mut consider = |wait: Duration| {
        if wait > Duration::ZERO && earliest.is_none_or(|current| wait < current) {
            earliest = Some(wait);
        }
    };

    for state in &registry.keys {
        if let Some(wait) = breaker.reset_wait(state, now) {
            consider(wait);
        }

        consider(rate_limiter::next_token_wait(state, now));

        if let Some(until) = state.rate_limited_until {
            consider(until.saturating_duration_since(now));
        }
    }

    earliest.unwrap_or(DEFAULT_RETRY_AFTER)
}
