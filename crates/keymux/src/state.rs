//! Mutable per-key runtime state and the ordered key registry.

use config::KeyConfig;
use jiff::Timestamp;
use tokio::time::Instant;

/// Observed state of a key's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Traffic flows normally.
    Closed,
    /// The key is blocked until the reset timeout elapses.
    Open,
    /// One probe request is allowed through to test recovery.
    HalfOpen,
}

/// Runtime state for one registered key.
///
/// Owned by the registry; components operate on it but never hold a
/// reference back, so there are no cycles. All mutation happens under the
/// registry lock.
pub(crate) struct KeyState {
    pub config: KeyConfig,

    /// Requests counted against the quota in the current period.
    pub quota_used: u64,
    /// Start of the current quota period (UTC).
    pub period_start: Timestamp,
    /// Whether the warning hook already fired this period.
    pub warned: bool,

    /// Current token balance. Meaningful only when `config.rps` is set.
    pub tokens: f64,
    /// Last time the bucket was refilled.
    pub last_refill: Instant,

    /// While in the future, the key is shelved regardless of its bucket.
    pub rate_limited_until: Option<Instant>,

    pub circuit: CircuitState,
    /// Set while the circuit is open; cleared on any transition out.
    pub circuit_open_until: Option<Instant>,
    pub consecutive_failures: u32,

    /// Last successful dispatch through this key.
    pub last_used: Option<Instant>,
}

impl KeyState {
    pub fn new(config: KeyConfig, now: Instant, wall: Timestamp) -> Self {
        let tokens = config.rps.unwrap_or(0.0);

        Self {
            config,
            quota_used: 0,
            period_start: wall,
            warned: false,
            tokens,
            last_refill: now,
            rate_limited_until: None,
            circuit: CircuitState::Closed,
            circuit_open_until: None,
            consecutive_failures: 0,
            last_used: None,
        }
    }

    /// Whether a temporary rate-limit window is active.
    pub fn in_rate_limit_window(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

/// The ordered collection of key states plus the selector cursor.
///
/// Registration order is load-bearing: the weighted round-robin sequence is
/// built from it.
pub(crate) struct Registry {
    pub keys: Vec<KeyState>,
    /// Position in the weighted sequence where the next scan starts.
    pub cursor: usize,
}

impl Registry {
    pub fn new(keys: Vec<KeyState>) -> Self {
        Self { keys, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.iter().any(|key| key.id() == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut KeyState> {
        self.keys.iter_mut().find(|key| key.id() == id)
    }

    pub fn push(&mut self, state: KeyState) {
        self.keys.push(state);
    }

    pub fn remove(&mut self, id: &str) -> Option<KeyState> {
        let index = self.keys.iter().position(|key| key.id() == id)?;
        Some(self.keys.remove(index))
    }
}
