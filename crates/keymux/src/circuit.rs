//! Per-key circuit breaker.
//!
//! Closed / open / half-open with a consecutive-failure counter. The
//! open-to-half-open transition is observed lazily: it happens the next time
//! anyone reads the state after the reset timeout has passed. Methods that
//! transition into the open state return `true` so the caller can fire the
//! circuit-open hook outside the registry lock; repeated failures on an
//! already-open key never re-signal.

use std::time::Duration;

use tokio::time::Instant;

use crate::state::{CircuitState, KeyState};

pub(crate) struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }

    /// Current state, applying the lazy open-to-half-open transition.
    pub fn current_state(&self, state: &mut KeyState, now: Instant) -> CircuitState {
        if state.circuit == CircuitState::Open
            && state.circuit_open_until.is_some_and(|until| now >= until)
        {
            log::debug!("circuit for key '{}' moved to half-open", state.id());
            state.circuit = CircuitState::HalfOpen;
            state.circuit_open_until = None;
        }

        state.circuit
    }

    /// Record a failed attempt. Returns whether the circuit opened now.
    pub fn record_failure(&self, state: &mut KeyState, now: Instant) -> bool {
        let observed = self.current_state(state, now);
        state.consecutive_failures += 1;

        match observed {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.failure_threshold {
                    self.trip(state, now);
                    true
                } else {
                    false
                }
            }
            // Counter keeps growing but the key is already isolated.
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                self.trip(state, now);
                true
            }
        }
    }

    /// Record a successful attempt: failures reset and the circuit closes,
    /// unless an operator is holding it open.
    pub fn record_success(&self, state: &mut KeyState, now: Instant) {
        let observed = self.current_state(state, now);
        state.consecutive_failures = 0;

        if observed != CircuitState::Open {
            state.circuit = CircuitState::Closed;
            state.circuit_open_until = None;
        }
    }

    /// Operator override. Returns whether this was a transition into open.
    pub fn force_open(&self, state: &mut KeyState, now: Instant) -> bool {
        let was_open = self.current_state(state, now) == CircuitState::Open;
        self.trip(state, now);
        !was_open
    }

    /// Operator override: close the circuit and forget the failures.
    pub fn force_close(&self, state: &mut KeyState) {
        state.circuit = CircuitState::Closed;
        state.circuit_open_until = None;
        state.consecutive_failures = 0;
    }

    /// Remaining open time, if the circuit is open.
    pub fn reset_wait(&self, state: &KeyState, now: Instant) -> Option<Duration> {
        if state.circuit != CircuitState::Open {
            return None;
        }

        state
            .circuit_open_until
            .map(|until| until.saturating_duration_since(now))
    }

    fn trip(&self, state: &mut KeyState, now: Instant) {
        log::warn!(
            "circuit for key '{}' opened after {} consecutive failures",
            state.id(),
            state.consecutive_failures
        );
        state.circuit = CircuitState::Open;
        state.circuit_open_until = Some(now + self.reset_timeout);
    }
}
