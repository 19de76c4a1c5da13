//! The dispatcher facade.
//!
//! [`KeyPool`] wires the components together: it owns the key registry, the
//! request queue, the worker and deadline-sweep tasks, and exposes the
//! caller-facing contract. Construction validates configuration eagerly;
//! everything after that is per-request.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use config::{Config, KeyConfig, PoolConfig};
use jiff::Timestamp;
use secrecy::SecretString;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitBreaker;
use crate::classify::Classifier;
use crate::error::{BoxError, PoolError};
use crate::executor::Executor;
use crate::health::PoolHealth;
use crate::hooks::PoolHooks;
use crate::queue::{Job, QueuedRequest, RequestQueue};
use crate::quota::QuotaTracker;
use crate::state::{CircuitState, KeyState, Registry};
use crate::storage::{InMemoryStorage, KeyValueStorage};
use crate::{health, rate_limiter};

/// How often the queue is checked for overdue entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the facade, worker and sweeper share.
pub(crate) struct PoolShared<R> {
    pub config: PoolConfig,
    pub registry: Mutex<Registry>,
    pub queue: RequestQueue<R>,
    pub classifier: Classifier<R>,
    pub hooks: PoolHooks,
    pub quota: QuotaTracker,
    pub breaker: CircuitBreaker,
    pub cancel: CancellationToken,
}

impl<R> PoolShared<R> {
    pub fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore persisted quota counters for every bounded key. Runs once,
    /// before the worker dispatches its first request.
    pub async fn load_initial(&self) {
        let ids: Vec<String> = {
            let registry = self.lock_registry();
            registry
                .keys
                .iter()
                .filter(|state| !state.config.quota.is_unlimited())
                .map(|state| state.id().to_string())
                .collect()
        };

        for id in ids {
            if let Some(record) = self.quota.load_record(&id).await {
                let mut registry = self.lock_registry();
                if let Some(state) = registry.find_mut(&id) {
                    self.quota.apply_record(state, record);
                }
            }
        }

        log::debug!("initial quota state loaded");
    }
}

/// Per-call overrides for [`KeyPool::execute_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Maximum time this request may wait in the queue. Falls back to the
    /// pool's `max_wait`.
    pub max_wait: Option<Duration>,
}

/// Observability snapshot for one key.
#[derive(Debug, Clone)]
pub struct KeyStats {
    /// The key id.
    pub id: String,
    /// Requests counted against the quota in the current period.
    pub quota_used: u64,
    /// Remaining budget; `None` for unlimited keys.
    pub quota_remaining: Option<u64>,
    /// Whether a temporary rate-limit window is active.
    pub is_rate_limited: bool,
    /// Current circuit state, after lazy transitions.
    pub circuit_state: CircuitState,
    /// Whether the circuit is open.
    pub is_circuit_open: bool,
    /// Whether the quota is spent for the current period.
    pub is_exhausted: bool,
    /// Observed consumption rate against the token bucket.
    pub current_rps: f64,
    /// Configured rate, if any.
    pub rps_limit: Option<f64>,
    /// Consecutive failures recorded by the circuit breaker.
    pub consecutive_failures: u32,
    /// Last successful dispatch through this key.
    pub last_used: Option<Instant>,
}

struct WorkerTasks {
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// A credential-multiplexing dispatcher over a set of keys.
///
/// Callers submit a request function; the pool picks an eligible key,
/// enforces its rate and quota limits, rotates to another key on failure
/// and resolves with the first successful response. Generic over the
/// caller's response type `R`, which the configured [`Classifier`]
/// interprets.
pub struct KeyPool<R> {
    shared: Arc<PoolShared<R>>,
    tasks: Mutex<Option<WorkerTasks>>,
}

impl<R> std::fmt::Debug for KeyPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool").finish_non_exhaustive()
    }
}

impl<R: Send + 'static> KeyPool<R> {
    /// Start building a pool.
    pub fn builder() -> KeyPoolBuilder<R> {
        KeyPoolBuilder::new()
    }

    /// Submit a request with the pool's default queue deadline.
    ///
    /// `request` receives the chosen key's secret value and may be invoked
    /// once per attempted key. Resolves with the first response classified
    /// as a success, or the typed failure that ended the attempt.
    pub async fn execute<F, Fut>(&self, request: F) -> Result<R, PoolError>
    where
        F: Fn(SecretString) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        self.execute_with(request, ExecuteOptions::default()).await
    }

    /// Submit a request with per-call overrides.
    pub async fn execute_with<F, Fut>(&self, request: F, options: ExecuteOptions) -> Result<R, PoolError>
    where
        F: Fn(SecretString) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        let job: Job<R> = Box::new(move |secret| Box::pin(request(secret)));
        let (reply, receiver) = oneshot::channel();

        self.shared.queue.push(QueuedRequest {
            queued_at: Instant::now(),
            max_wait: options.max_wait.unwrap_or(self.shared.config.max_wait),
            job,
            reply,
        })?;

        match receiver.await {
            Ok(result) => result,
            // The worker is gone; only shutdown drops reply senders.
            Err(_) => Err(PoolError::Shutdown),
        }
    }

    /// Current pool health snapshot.
    pub fn health(&self) -> PoolHealth {
        let mut registry = self.shared.lock_registry();

        health::snapshot(
            &mut registry,
            &self.shared.quota,
            &self.shared.breaker,
            Instant::now(),
            Timestamp::now(),
        )
    }

    /// Observability snapshot for one key.
    pub fn key_stats(&self, id: &str) -> Result<KeyStats, PoolError> {
        let mut registry = self.shared.lock_registry();
        let now = Instant::now();
        let wall = Timestamp::now();

        let state = registry
            .find_mut(id)
            .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;

        Ok(self.stats_for(state, now, wall))
    }

    /// Observability snapshots for every key, in registration order.
    pub fn all_key_stats(&self) -> Vec<KeyStats> {
        let mut registry = self.shared.lock_registry();
        let now = Instant::now();
        let wall = Timestamp::now();

        registry
            .keys
            .iter_mut()
            .map(|state| self.stats_for(state, now, wall))
            .collect()
    }

    /// Number of requests currently waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.len()
    }

    /// Register a new key. The persisted quota counter, if any, is loaded
    /// before the key becomes eligible for selection.
    pub async fn add_key(&self, config: KeyConfig) -> Result<(), PoolError> {
        config.validate().map_err(|reason| PoolError::InvalidKeyConfig {
            key_id: config.id.clone(),
            reason,
        })?;

        if self.shared.lock_registry().contains(&config.id) {
            return Err(duplicate_key(&config.id));
        }

        let mut state = KeyState::new(config, Instant::now(), Timestamp::now());

        if let Some(record) = self.shared.quota.load_record(state.id()).await {
            self.shared.quota.apply_record(&mut state, record);
        }

        let mut registry = self.shared.lock_registry();

        // Re-check: another add may have raced while we read storage.
        if registry.contains(state.id()) {
            return Err(duplicate_key(state.id()));
        }

        log::debug!("registered key '{}'", state.id());
        registry.push(state);
        Ok(())
    }

    /// Deregister a key. In-flight requests on it complete naturally.
    pub fn remove_key(&self, id: &str) -> Result<(), PoolError> {
        match self.shared.lock_registry().remove(id) {
            Some(_) => {
                log::debug!("removed key '{id}'");
                Ok(())
            }
            None => Err(PoolError::KeyNotFound(id.to_string())),
        }
    }

    /// Operator override: close a key's circuit and forget its failures.
    pub fn close_circuit(&self, id: &str) -> Result<(), PoolError> {
        let mut registry = self.shared.lock_registry();

        let state = registry
            .find_mut(id)
            .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;

        self.shared.breaker.force_close(state);
        Ok(())
    }

    /// Operator override: open a key's circuit. Fires the circuit-open
    /// hook when this is a transition.
    pub fn open_circuit(&self, id: &str) -> Result<(), PoolError> {
        let opened = {
            let mut registry = self.shared.lock_registry();

            let state = registry
                .find_mut(id)
                .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;

            self.shared.breaker.force_open(state, Instant::now())
        };

        if opened {
            self.shared.hooks.key_circuit_open(id);
        }

        Ok(())
    }

    /// Operator override: zero a key's quota counter and restart its
    /// period. The persisted record is dropped too.
    pub fn reset_quota(&self, id: &str) -> Result<(), PoolError> {
        let mut registry = self.shared.lock_registry();

        let state = registry
            .find_mut(id)
            .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;

        self.shared.quota.reset(state, Timestamp::now());
        Ok(())
    }

    /// Stop the pool: pending requests fail with [`PoolError::Shutdown`],
    /// further submissions are refused, in-flight upstream calls complete
    /// naturally.
    pub async fn shutdown(&self) {
        log::debug!("shutting down dispatcher");

        self.shared.cancel.cancel();
        self.shared.queue.close();

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(tasks) = tasks {
            let _ = tasks.worker.await;
            let _ = tasks.sweeper.await;
        }
    }

    fn stats_for(&self, state: &mut KeyState, now: Instant, wall: Timestamp) -> KeyStats {
        let circuit = self.shared.breaker.current_state(state, now);
        let has_quota = self.shared.quota.has_quota(state, wall);

        KeyStats {
            id: state.id().to_string(),
            quota_used: state.quota_used,
            quota_remaining: self.shared.quota.remaining(state),
            is_rate_limited: state.in_rate_limit_window(now),
            circuit_state: circuit,
            is_circuit_open: circuit == CircuitState::Open,
            is_exhausted: !has_quota,
            current_rps: rate_limiter::current_rps(state, now),
            rps_limit: state.config.rps,
            consecutive_failures: state.consecutive_failures,
            last_used: state.last_used,
        }
    }
}

impl<R> Drop for KeyPool<R> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.queue.close();
    }
}

fn duplicate_key(id: &str) -> PoolError {
    PoolError::InvalidKeyConfig {
        key_id: id.to_string(),
        reason: "duplicate key id".to_string(),
    }
}

/// Builder for [`KeyPool`].
pub struct KeyPoolBuilder<R> {
    keys: Vec<KeyConfig>,
    config: PoolConfig,
    classifier: Classifier<R>,
    hooks: PoolHooks,
    storage: Option<Arc<dyn KeyValueStorage>>,
}

impl<R: Send + 'static> KeyPoolBuilder<R> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            config: PoolConfig::default(),
            classifier: Classifier::default(),
            hooks: PoolHooks::default(),
            storage: None,
        }
    }

    /// Register a key. Order matters for round-robin.
    pub fn key(mut self, key: KeyConfig) -> Self {
        self.keys.push(key);
        self
    }

    /// Register several keys, preserving iteration order.
    pub fn keys(mut self, keys: impl IntoIterator<Item = KeyConfig>) -> Self {
        self.keys.extend(keys);
        self
    }

    /// Set the pool-wide tuning knobs.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Adopt keys and pool settings from a loaded configuration file.
    pub fn from_config(mut self, config: Config) -> Self {
        self.config = config.pool;
        self.keys.extend(config.keys);
        self
    }

    /// Set the response classifier.
    pub fn classifier(mut self, classifier: Classifier<R>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Set the operator hooks.
    pub fn hooks(mut self, hooks: PoolHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Use a custom storage backend for quota counters. Defaults to the
    /// process-local in-memory store.
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate the configuration and start the pool.
    ///
    /// Must be called within a tokio runtime: the worker and deadline-sweep
    /// tasks are spawned here.
    pub fn build(self) -> Result<KeyPool<R>, PoolError> {
        self.config
            .validate()
            .map_err(|reason| PoolError::InvalidPoolConfig { reason })?;

        if self.keys.is_empty() {
            return Err(PoolError::NoKeysConfigured);
        }

        let mut seen = HashSet::new();

        for key in &self.keys {
            key.validate().map_err(|reason| PoolError::InvalidKeyConfig {
                key_id: key.id.clone(),
                reason,
            })?;

            if !seen.insert(key.id.clone()) {
                return Err(duplicate_key(&key.id));
            }
        }

        let now = Instant::now();
        let wall = Timestamp::now();
        let states: Vec<KeyState> = self
            .keys
            .into_iter()
            .map(|key| KeyState::new(key, now, wall))
            .collect();

        log::debug!("starting dispatcher with {} keys", states.len());

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn KeyValueStorage>);

        let shared = Arc::new(PoolShared {
            registry: Mutex::new(Registry::new(states)),
            queue: RequestQueue::new(self.config.max_queue_size),
            classifier: self.classifier,
            hooks: self.hooks,
            quota: QuotaTracker::new(storage, self.config.warning_threshold),
            breaker: CircuitBreaker::new(self.config.failure_threshold, self.config.reset_timeout),
            cancel: CancellationToken::new(),
            config: self.config,
        });

        let worker = tokio::spawn(Executor::new(Arc::clone(&shared)).run(shared.cancel.clone()));
        let sweeper = tokio::spawn(run_sweeper(Arc::clone(&shared), shared.cancel.clone()));

        Ok(KeyPool {
            shared,
            tasks: Mutex::new(Some(WorkerTasks { worker, sweeper })),
        })
    }
}

/// Fails overdue queue entries while the worker is busy elsewhere.
async fn run_sweeper<R>(shared: Arc<PoolShared<R>>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => shared.queue.sweep(),
        }
    }
}
