//! The dispatch worker.
//!
//! A single task drains the queue. For each request it walks the keys the
//! selector offers, consuming a rate-limit token, invoking the caller's
//! function and classifying the outcome, until the request resolves or the
//! retry budget is spent. Retries always cross keys: a key that failed for
//! this request is excluded from its remaining attempts.
//!
//! Locking discipline: the registry lock is taken for selection and for
//! state updates, and is never held across the caller's function. Hooks
//! fire after the lock is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use secrecy::SecretString;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitBreaker;
use crate::classify::Outcome;
use crate::error::PoolError;
use crate::pool::PoolShared;
use crate::queue::QueuedRequest;
use crate::quota::{QuotaEvents, QuotaTracker};
use crate::rate_limiter;
use crate::selector;
use crate::state::Registry;

enum Attempt {
    /// A key was selected and a token consumed.
    Ready { id: String, secret: SecretString },
    /// A key was selected but the bucket came up empty; the attempt is
    /// spent without invoking the caller's function.
    OutOfTokens,
    /// No eligible key at all.
    NoneEligible(PoolError),
}

pub(crate) struct Executor<R> {
    shared: Arc<PoolShared<R>>,
}

impl<R: Send + 'static> Executor<R> {
    pub fn new(shared: Arc<PoolShared<R>>) -> Self {
        Self { shared }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // No request dispatches before persisted quota counters are in.
        self.shared.load_initial().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.shared.queue.pop() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => break,
                },
            }
        }

        log::debug!("dispatch worker stopped");
    }

    async fn dispatch(&self, request: QueuedRequest<R>) {
        let shared = &self.shared;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = None;

        let max_retries = {
            let registry = shared.lock_registry();
            shared.config.max_retries.unwrap_or(registry.len())
        };

        for _ in 0..max_retries {
            let attempt = self.next_attempt(&mut tried);

            let (id, secret) = match attempt {
                Attempt::Ready { id, secret } => (id, secret),
                Attempt::OutOfTokens => continue,
                Attempt::NoneEligible(error) => {
                    shared.hooks.all_keys_exhausted();
                    let _ = request.reply.send(Err(error));
                    return;
                }
            };

            match (request.job)(secret).await {
                Err(error) => {
                    log::debug!("key '{id}': request function failed: {error}");
                    self.fail_key(&id);
                    last_error = Some(error);
                }
                Ok(response) => match shared.classifier.classify(&response) {
                    Outcome::RateLimited { retry_after_secs } => {
                        let backoff = retry_after_secs
                            .map(Duration::from_secs)
                            .unwrap_or(shared.config.rate_limit_backoff);

                        log::debug!("key '{id}': upstream rate limit, shelving for {backoff:?}");

                        let mut registry = shared.lock_registry();
                        if let Some(state) = registry.find_mut(&id) {
                            state.rate_limited_until = Some(Instant::now() + backoff);
                        }
                    }
                    Outcome::Error => {
                        log::debug!("key '{id}': upstream error response");
                        self.fail_key(&id);
                    }
                    Outcome::Success { quota_remaining } => {
                        let events = self.succeed_key(&id, quota_remaining);

                        if let Some(usage) = events.warning {
                            shared.hooks.warning(&id, usage);
                        }
                        if events.exhausted {
                            shared.hooks.key_exhausted(&id);
                        }

                        let _ = request.reply.send(Ok(response));
                        return;
                    }
                },
            }
        }

        let error = match last_error {
            Some(error) => PoolError::Upstream(error),
            None => {
                let mut registry = shared.lock_registry();
                exhausted_error(&mut registry, &shared.quota, &shared.breaker)
            }
        };

        let _ = request.reply.send(Err(error));
    }

    /// Pick the next untried key and take a token from it.
    fn next_attempt(&self, tried: &mut HashSet<String>) -> Attempt {
        let shared = &self.shared;
        let mut registry = shared.lock_registry();
        let now = Instant::now();
        let wall = Timestamp::now();

        let Some(index) = selector::select(&mut registry, tried, &shared.quota, &shared.breaker, now, wall)
        else {
            return Attempt::NoneEligible(exhausted_error(&mut registry, &shared.quota, &shared.breaker));
        };

        let state = &mut registry.keys[index];
        let id = state.id().to_string();
        tried.insert(id.clone());

        if rate_limiter::try_consume(state, now) {
            Attempt::Ready {
                id,
                secret: state.config.value.clone(),
            }
        } else {
            Attempt::OutOfTokens
        }
    }

    /// Count a failure against the key, signalling if the circuit opened.
    fn fail_key(&self, id: &str) {
        let opened = {
            let mut registry = self.shared.lock_registry();
            registry
                .find_mut(id)
                .is_some_and(|state| self.shared.breaker.record_failure(state, Instant::now()))
        };

        if opened {
            self.shared.hooks.key_circuit_open(id);
        }
    }

    /// Apply the success bookkeeping; returns quota events to report.
    fn succeed_key(&self, id: &str, quota_remaining: Option<u64>) -> QuotaEvents {
        let shared = &self.shared;
        let mut registry = shared.lock_registry();
        let now = Instant::now();

        let Some(state) = registry.find_mut(id) else {
            // Removed while the request was in flight; nothing to record.
            return QuotaEvents::default();
        };

        shared.breaker.record_success(state, now);
        state.rate_limited_until = None;
        state.last_used = Some(now);

        let events = shared.quota.increment(state, 1, Timestamp::now());

        if let Some(remaining) = quota_remaining {
            shared.quota.sync_from_response(state, remaining);
        }

        events
    }
}

/// Snapshot the availability breakdown into an `AllKeysExhausted` error.
pub(crate) fn exhausted_error(registry: &mut Registry, quota: &QuotaTracker, breaker: &CircuitBreaker) -> PoolError {
    let now = Instant::now();
    let counts = selector::breakdown(registry, quota, breaker, now, Timestamp::now());

    PoolError::AllKeysExhausted {
        total_keys: registry.len(),
        exhausted_keys: counts.quota_exhausted,
        circuit_open_keys: counts.circuit_open,
        rate_limited_keys: counts.rate_limited,
        retry_after: selector::next_available(registry, breaker, now),
    }
}
