//! Credential-multiplexing dispatcher.
//!
//! Keymux fronts a set of outbound API credentials and lets callers submit
//! requests without naming a key. Each request is queued, handed to a
//! single dispatch worker, and driven through weighted round-robin key
//! selection, per-key token buckets, quota accounting with calendar
//! rollover, and per-key circuit breakers. Rate-limited and failing keys
//! are rotated past; quota counters survive restarts through a pluggable
//! storage backend.
//!
//! ```no_run
//! use keymux::{Classifier, ExposeSecret, KeyConfig, KeyPool, QuotaConfig};
//!
//! # #[derive(Clone)] struct Response { status: u16 }
//! # async fn call_upstream(_: &str) -> Result<Response, keymux::BoxError> { todo!() }
//! # async fn example() -> Result<(), keymux::PoolError> {
//! let pool = KeyPool::builder()
//!     .key(
//!         KeyConfig::new("primary", "sk-primary")
//!             .with_quota(QuotaConfig::Monthly { limit: 100_000 })
//!             .with_rps(10.0),
//!     )
//!     .key(KeyConfig::new("fallback", "sk-fallback"))
//!     .classifier(
//!         Classifier::builder()
//!             .is_rate_limited(|r: &Response| r.status == 429)
//!             .is_error(|r: &Response| r.status >= 500)
//!             .build(),
//!     )
//!     .build()?;
//!
//! let response = pool
//!     .execute(|key| async move { call_upstream(key.expose_secret()).await })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod circuit;
mod classify;
mod error;
mod executor;
mod health;
mod hooks;
mod pool;
mod queue;
mod quota;
mod rate_limiter;
mod selector;
mod state;
mod storage;

pub use classify::{Classifier, ClassifierBuilder};
pub use config::{Config, KeyConfig, PoolConfig, QuotaConfig};
pub use error::{BoxError, PoolError};
pub use health::{HealthStatus, KeyWarning, PoolHealth, WarningKind};
pub use hooks::{PoolHooks, PoolHooksBuilder};
pub use pool::{ExecuteOptions, KeyPool, KeyPoolBuilder, KeyStats};
pub use secrecy::{ExposeSecret, SecretString};
pub use state::CircuitState;
pub use storage::{InMemoryStorage, KeyValueStorage, StorageError};
