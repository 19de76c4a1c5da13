//! Storage collaborator contract for persisted quota counters.
//!
//! The dispatcher persists one small JSON record per bounded key under
//! `quota:<keyId>`. Storage is a best-effort durability layer, never a lock:
//! backends must tolerate concurrent access, treat unknown keys as absent,
//! and may drop writes under pressure without affecting the in-memory state.

pub mod memory;

pub use memory::InMemoryStorage;

use std::time::Duration;

use async_trait::async_trait;

/// An opaque key/value store with optional per-entry expiry.
///
/// Dyn-compatible so backends can be swapped behind `Arc<dyn
/// KeyValueStorage>`; implement it for on-disk or remote stores to carry
/// quota counters across process restarts.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Fetch a value. Unknown keys are `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a value, replacing any previous one. A `ttl` bounds the
    /// entry's lifetime; `None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Errors a storage backend can produce.
///
/// The dispatcher logs and drops these; they never fail a user request.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Internal storage error.
    #[error("Storage error: {0}")]
    Internal(String),

    /// Connection error talking to a remote backend.
    #[error("Connection error: {0}")]
    Connection(String),
}
