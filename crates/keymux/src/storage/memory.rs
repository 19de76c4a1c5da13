//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{KeyValueStorage, StorageError};

struct Entry {
    value: String,
    /// Entries past this instant are treated as absent and dropped on the
    /// next read.
    expires_at: Option<Instant>,
}

/// The default storage backend: a mutexed map with lazy per-entry expiry.
///
/// Counters survive for the lifetime of the process only; use a durable
/// backend when quota accounting must outlive restarts.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut entries = self.lock();

        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| Instant::now() >= at));

        if expired {
            entries.remove(key);
            return Ok(None);
        }

        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };

        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_keys_are_none() {
        let storage = InMemoryStorage::new();
        assert!(storage.get("quota:missing").await.unwrap().is_none());
        storage.delete("quota:missing").await.unwrap();
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let storage = InMemoryStorage::new();

        storage.set("quota:k", "{}", None).await.unwrap();
        assert_eq!(storage.get("quota:k").await.unwrap().as_deref(), Some("{}"));

        storage.set("quota:k", "{\"quotaUsed\":1}", None).await.unwrap();
        assert_eq!(
            storage.get("quota:k").await.unwrap().as_deref(),
            Some("{\"quotaUsed\":1}")
        );

        storage.delete("quota:k").await.unwrap();
        assert!(storage.get("quota:k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily() {
        let storage = InMemoryStorage::new();

        storage
            .set("quota:k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(storage.get("quota:k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(storage.get("quota:k").await.unwrap().is_none());
    }
}
