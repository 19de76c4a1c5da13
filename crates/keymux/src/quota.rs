//! Quota accounting with periodic resets and best-effort persistence.
//!
//! Period boundaries follow the UTC calendar: a monthly quota resets when
//! `(year, month)` of the current instant is strictly greater than that of
//! the period start, a yearly quota when the year is. Every read runs the
//! rollover check first, so a key parked over a month boundary comes back
//! with a fresh budget the moment it is next considered.
//!
//! Counters are written to storage after each mutation as fire-and-forget
//! JSON records; the dispatch path never waits on storage and never fails
//! because of it.

use std::sync::Arc;
use std::time::Duration;

use config::QuotaConfig;
use jiff::Timestamp;
use jiff::tz::TimeZone;
use serde::{Deserialize, Serialize};

use crate::state::KeyState;
use crate::storage::KeyValueStorage;

/// Comfortably past one calendar month, so a record outlives its period but
/// not much more.
const MONTHLY_TTL: Duration = Duration::from_secs(35 * 24 * 60 * 60);
/// Comfortably past one calendar year.
const YEARLY_TTL: Duration = Duration::from_secs(370 * 24 * 60 * 60);

/// Quota-related facts the executor reports through hooks after releasing
/// the registry lock.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct QuotaEvents {
    /// Usage fraction, set the first time it crosses the warning threshold
    /// within a period.
    pub warning: Option<f64>,
    /// Set on the increment that first reaches the limit.
    pub exhausted: bool,
}

/// The persisted record, stored under `quota:<keyId>`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuotaRecord {
    pub quota_used: u64,
    pub period_start: Timestamp,
}

pub(crate) struct QuotaTracker {
    storage: Arc<dyn KeyValueStorage>,
    warning_threshold: f64,
}

impl QuotaTracker {
    pub fn new(storage: Arc<dyn KeyValueStorage>, warning_threshold: f64) -> Self {
        Self {
            storage,
            warning_threshold,
        }
    }

    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    /// Whether the key has budget left in the current period.
    pub fn has_quota(&self, state: &mut KeyState, now: Timestamp) -> bool {
        self.rollover_if_due(state, now);

        match state.config.quota.limit() {
            Some(limit) => state.quota_used < limit,
            None => true,
        }
    }

    /// Remaining budget; `None` for unlimited keys.
    pub fn remaining(&self, state: &KeyState) -> Option<u64> {
        state
            .config
            .quota
            .limit()
            .map(|limit| limit.saturating_sub(state.quota_used))
    }

    /// Usage fraction of the limit; `None` for unlimited keys.
    pub fn usage(&self, state: &KeyState) -> Option<f64> {
        state
            .config
            .quota
            .limit()
            .map(|limit| state.quota_used as f64 / limit as f64)
    }

    /// Count `n` requests against the key. Unlimited keys are not counted.
    pub fn increment(&self, state: &mut KeyState, n: u64, now: Timestamp) -> QuotaEvents {
        self.rollover_if_due(state, now);

        let mut events = QuotaEvents::default();

        let Some(limit) = state.config.quota.limit() else {
            return events;
        };

        let before = state.quota_used;
        state.quota_used += n;

        let usage = state.quota_used as f64 / limit as f64;

        if !state.warned && usage >= self.warning_threshold {
            state.warned = true;
            events.warning = Some(usage);
        }

        if state.quota_used >= limit && before < limit {
            log::warn!(
                "key '{}' exhausted its quota ({}/{limit})",
                state.id(),
                state.quota_used
            );
            events.exhausted = true;
        }

        self.persist(state);
        events
    }

    /// Adopt the server's view of remaining quota, upward only: local
    /// accounting is never rewound.
    pub fn sync_from_response(&self, state: &mut KeyState, remaining: u64) {
        let Some(limit) = state.config.quota.limit() else {
            return;
        };

        let implied = limit.saturating_sub(remaining);

        if implied > state.quota_used {
            log::debug!(
                "key '{}': server reports {remaining} remaining, bumping local count {} -> {implied}",
                state.id(),
                state.quota_used
            );
            state.quota_used = implied;
            self.persist(state);
        }
    }

    /// Operator reset: zero the counter, restart the period, drop the
    /// persisted record.
    pub fn reset(&self, state: &mut KeyState, now: Timestamp) {
        state.quota_used = 0;
        state.period_start = now;
        state.warned = false;

        let storage = Arc::clone(&self.storage);
        let key = record_key(state.id());

        tokio::spawn(async move {
            if let Err(error) = storage.delete(&key).await {
                log::warn!("failed to delete quota record '{key}': {error}");
            }
        });
    }

    /// Fetch the persisted record for a key, discarding malformed data.
    pub async fn load_record(&self, id: &str) -> Option<QuotaRecord> {
        let key = record_key(id);

        match self.storage.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(error) => {
                    log::warn!("discarding malformed quota record '{key}': {error}");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                log::warn!("failed to load quota record '{key}': {error}");
                None
            }
        }
    }

    /// Apply a loaded record to a fresh key state.
    pub fn apply_record(&self, state: &mut KeyState, record: QuotaRecord) {
        if state.config.quota.is_unlimited() {
            return;
        }

        log::debug!(
            "key '{}': restored quota count {} (period started {})",
            state.id(),
            record.quota_used,
            record.period_start
        );
        state.quota_used = record.quota_used;
        state.period_start = record.period_start;
    }

    fn rollover_if_due(&self, state: &mut KeyState, now: Timestamp) {
        let due = match state.config.quota {
            QuotaConfig::Monthly { .. } => {
                let current = to_civil(now);
                let period = to_civil(state.period_start);
                (current.0, current.1) > (period.0, period.1)
            }
            QuotaConfig::Yearly { .. } => to_civil(now).0 > to_civil(state.period_start).0,
            QuotaConfig::Total { .. } | QuotaConfig::Unlimited => false,
        };

        if due {
            log::debug!(
                "key '{}': quota period rolled over, clearing {} used",
                state.id(),
                state.quota_used
            );
            state.quota_used = 0;
            state.period_start = now;
            state.warned = false;
        }
    }

    fn persist(&self, state: &KeyState) {
        let record = QuotaRecord {
            quota_used: state.quota_used,
            period_start: state.period_start,
        };

        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(error) => {
                log::error!("failed to serialize quota record for '{}': {error}", state.id());
                return;
            }
        };

        let ttl = match state.config.quota {
            QuotaConfig::Monthly { .. } => Some(MONTHLY_TTL),
            QuotaConfig::Yearly { .. } => Some(YEARLY_TTL),
            QuotaConfig::Total { .. } | QuotaConfig::Unlimited => None,
        };

        let storage = Arc::clone(&self.storage);
        let key = record_key(state.id());

        tokio::spawn(async move {
            if let Err(error) = storage.set(&key, &json, ttl).await {
                log::warn!("failed to persist quota record '{key}': {error}");
            }
        });
    }
}

/// Storage key for a key's quota record.
pub(crate) fn record_key(id: &str) -> String {
    format!("quota:{id}")
}

fn to_civil(timestamp: Timestamp) -> (i16, i8) {
    let zoned = timestamp.to_zoned(TimeZone::UTC);
    (zoned.year(), zoned.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use config::KeyConfig;
    use tokio::time::Instant;

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(Arc::new(InMemoryStorage::new()), 0.8)
    }

    fn state(quota: QuotaConfig, period_start: &str) -> KeyState {
        let config = KeyConfig::new("k", "secret").with_quota(quota);
        let mut state = KeyState::new(config, Instant::now(), period_start.parse().unwrap());
        state.period_start = period_start.parse().unwrap();
        state
    }

    fn ts(raw: &str) -> Timestamp {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn usage_is_monotonic_within_a_period() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Monthly { limit: 100 }, "2025-06-01T00:00:00Z");
        let now = ts("2025-06-15T12:00:00Z");

        for expected in 1..=10 {
            tracker.increment(&mut state, 1, now);
            assert_eq!(state.quota_used, expected);
        }

        assert!(tracker.has_quota(&mut state, now));
        assert_eq!(tracker.remaining(&state), Some(90));
    }

    #[tokio::test]
    async fn monthly_rollover_on_calendar_boundary() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Monthly { limit: 10 }, "2025-06-30T23:00:00Z");
        state.quota_used = 10;
        state.warned = true;

        // Same month: still exhausted.
        assert!(!tracker.has_quota(&mut state, ts("2025-06-30T23:59:00Z")));

        // Next month: fresh budget, warning memoization cleared.
        assert!(tracker.has_quota(&mut state, ts("2025-07-01T00:01:00Z")));
        assert_eq!(state.quota_used, 0);
        assert!(!state.warned);
        assert_eq!(state.period_start, ts("2025-07-01T00:01:00Z"));
    }

    #[tokio::test]
    async fn yearly_rollover_ignores_months() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Yearly { limit: 10 }, "2025-02-01T00:00:00Z");
        state.quota_used = 10;

        assert!(!tracker.has_quota(&mut state, ts("2025-12-31T23:59:00Z")));
        assert!(tracker.has_quota(&mut state, ts("2026-01-01T00:00:01Z")));
        assert_eq!(state.quota_used, 0);
    }

    #[tokio::test]
    async fn total_quota_never_resets() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Total { limit: 5 }, "2020-01-01T00:00:00Z");
        state.quota_used = 5;

        assert!(!tracker.has_quota(&mut state, ts("2030-01-01T00:00:00Z")));
        assert_eq!(state.quota_used, 5);
    }

    #[tokio::test]
    async fn warning_fires_once_per_period() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Monthly { limit: 10 }, "2025-06-01T00:00:00Z");
        let now = ts("2025-06-15T00:00:00Z");

        for _ in 0..7 {
            let events = tracker.increment(&mut state, 1, now);
            assert_eq!(events.warning, None);
        }

        let events = tracker.increment(&mut state, 1, now);
        assert_eq!(events.warning, Some(0.8));

        let events = tracker.increment(&mut state, 1, now);
        assert_eq!(events.warning, None);
    }

    #[tokio::test]
    async fn exhaustion_fires_on_the_crossing_increment() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Monthly { limit: 3 }, "2025-06-01T00:00:00Z");
        let now = ts("2025-06-15T00:00:00Z");

        assert!(!tracker.increment(&mut state, 1, now).exhausted);
        assert!(!tracker.increment(&mut state, 1, now).exhausted);
        assert!(tracker.increment(&mut state, 1, now).exhausted);
        assert!(!tracker.increment(&mut state, 1, now).exhausted);
    }

    #[tokio::test]
    async fn unlimited_keys_are_not_counted() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Unlimited, "2025-06-01T00:00:00Z");
        let now = ts("2025-06-15T00:00:00Z");

        let events = tracker.increment(&mut state, 1, now);
        assert_eq!(events, QuotaEvents::default());
        assert_eq!(state.quota_used, 0);
        assert_eq!(tracker.remaining(&state), None);
    }

    #[tokio::test]
    async fn sync_never_rewinds() {
        let tracker = tracker();
        let mut state = state(QuotaConfig::Monthly { limit: 100 }, "2025-06-01T00:00:00Z");
        state.quota_used = 40;

        // Server claims more was used than we counted: adopt it.
        tracker.sync_from_response(&mut state, 50);
        assert_eq!(state.quota_used, 50);

        // Server claims less: keep the local count.
        tracker.sync_from_response(&mut state, 90);
        assert_eq!(state.quota_used, 50);
    }

    #[tokio::test]
    async fn persisted_record_round_trips() {
        let storage = Arc::new(InMemoryStorage::new());
        let tracker = QuotaTracker::new(Arc::clone(&storage) as Arc<dyn KeyValueStorage>, 0.8);

        let mut key_state = state(QuotaConfig::Monthly { limit: 100 }, "2025-06-01T00:00:00Z");
        tracker.increment(&mut key_state, 7, ts("2025-06-15T00:00:00Z"));

        // The write is fire-and-forget; let it land.
        tokio::task::yield_now().await;

        let record = tracker.load_record("k").await.unwrap();
        assert_eq!(record.quota_used, 7);

        let mut restored = state(QuotaConfig::Monthly { limit: 100 }, "2025-06-01T00:00:00Z");
        tracker.apply_record(&mut restored, record);
        assert_eq!(restored.quota_used, 7);
    }

    #[tokio::test]
    async fn malformed_records_are_discarded() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.set("quota:k", "not json", None).await.unwrap();

        let tracker = QuotaTracker::new(storage as Arc<dyn KeyValueStorage>, 0.8);
        assert!(tracker.load_record("k").await.is_none());
    }

    #[tokio::test]
    async fn record_uses_wire_field_names() {
        let record = QuotaRecord {
            quota_used: 50,
            period_start: ts("2025-06-01T00:00:00Z"),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"quotaUsed\":50"));
        assert!(json.contains("\"periodStart\":\"2025-06-01T00:00:00Z\""));
    }
}
