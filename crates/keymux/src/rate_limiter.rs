//! Per-key token bucket.
//!
//! A key with rate `r` owns a bucket of capacity `r` that refills
//! continuously at `r` tokens per second. Every read goes through
//! [`refill`] first, so the balance is always current when checked. Keys
//! without a configured rate are permanently at capacity.

use std::time::Duration;

use tokio::time::Instant;

use crate::state::KeyState;

/// Bring the bucket up to date. Invariant: `0 <= tokens <= rps` afterwards.
pub(crate) fn refill(state: &mut KeyState, now: Instant) {
    let Some(rps) = state.config.rps else {
        return;
    };

    let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
    state.tokens = (state.tokens + elapsed * rps).min(rps);
    state.last_refill = now;
}

/// Whether the bucket currently holds at least one token.
pub(crate) fn has_capacity(state: &mut KeyState, now: Instant) -> bool {
    if state.config.rps.is_none() {
        return true;
    }

    refill(state, now);
    state.tokens >= 1.0
}

/// Consume one token. Returns false if the bucket is below capacity.
pub(crate) fn try_consume(state: &mut KeyState, now: Instant) -> bool {
    if state.config.rps.is_none() {
        return true;
    }

    refill(state, now);

    if state.tokens >= 1.0 {
        state.tokens -= 1.0;
        true
    } else {
        log::trace!("key '{}' is out of tokens", state.id());
        false
    }
}

/// Time until the bucket holds a full token again, zero when it already
/// does. Computed against the projected balance so the caller does not need
/// a mutable borrow.
pub(crate) fn next_token_wait(state: &KeyState, now: Instant) -> Duration {
    let Some(rps) = state.config.rps else {
        return Duration::ZERO;
    };

    let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
    let projected = (state.tokens + elapsed * rps).min(rps);

    if projected >= 1.0 {
        Duration::ZERO
    } else {
        let millis = ((1.0 - projected) / rps * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }
}

/// Observed consumption rate, for stats only: configured rate minus the
/// projected balance, clamped at zero.
pub(crate) fn current_rps(state: &KeyState, now: Instant) -> f64 {
    let Some(rps) = state.config.rps else {
        return 0.0;
    };

    let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
    let projected = (state.tokens + elapsed * rps).min(rps);

    (rps - projected).max(0.0)
}

/// Refill the bucket to capacity.
pub(crate) fn reset(state: &mut KeyState, now: Instant) {
    if let Some(rps) = state.config.rps {
        state.tokens = rps;
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::KeyConfig;
    use jiff::Timestamp;

    fn state(rps: Option<f64>) -> KeyState {
        let mut config = KeyConfig::new("k", "secret");
        config.rps = rps;
        KeyState::new(config, Instant::now(), Timestamp::UNIX_EPOCH)
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_starts_full_and_drains_by_one() {
        let mut state = state(Some(3.0));

        assert!(try_consume(&mut state, Instant::now()));
        assert!(try_consume(&mut state, Instant::now()));
        assert!(try_consume(&mut state, Instant::now()));
        assert!(!try_consume(&mut state, Instant::now()));
        assert!(state.tokens >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_continuous_and_clamped() {
        let mut state = state(Some(2.0));

        while try_consume(&mut state, Instant::now()) {}
        assert!(state.tokens < 1.0);

        tokio::time::advance(Duration::from_millis(500)).await;
        refill(&mut state, Instant::now());
        let after_half_second = state.tokens;
        assert!((after_half_second - 1.0).abs() < 1e-6);

        // Idle long enough to overflow; balance clamps at capacity.
        tokio::time::advance(Duration::from_secs(60)).await;
        refill(&mut state, Instant::now());
        assert_eq!(state.tokens, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_time_is_ceiling_of_deficit() {
        let mut state = state(Some(2.0));
        while try_consume(&mut state, Instant::now()) {}

        // Balance is now in [0, 1); the deficit refills at 2/s, so the wait
        // is at most 500ms and always positive.
        let wait = next_token_wait(&state, Instant::now());
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(500));

        tokio::time::advance(wait).await;
        assert!(has_capacity(&mut state, Instant::now()));
        assert_eq!(next_token_wait(&state, Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_without_rate_are_always_at_capacity() {
        let mut state = state(None);

        for _ in 0..10_000 {
            assert!(try_consume(&mut state, Instant::now()));
        }

        assert_eq!(next_token_wait(&state, Instant::now()), Duration::ZERO);
        assert_eq!(current_rps(&state, Instant::now()), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn current_rps_reports_consumption() {
        let mut state = state(Some(5.0));

        assert_eq!(current_rps(&state, Instant::now()), 0.0);

        try_consume(&mut state, Instant::now());
        try_consume(&mut state, Instant::now());
        assert_eq!(current_rps(&state, Instant::now()), 2.0);

        reset(&mut state, Instant::now());
        assert_eq!(current_rps(&state, Instant::now()), 0.0);
        assert_eq!(state.tokens, 5.0);
    }
}
