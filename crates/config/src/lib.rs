//! Keymux configuration structures to map the keymux.toml configuration.

#![deny(missing_docs)]

mod key;
mod loader;
mod pool;

pub use key::{KeyConfig, QuotaConfig};
pub use loader::load;
pub use pool::PoolConfig;

use serde::Deserialize;

/// Main configuration structure for a keymux dispatcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pool-wide tuning knobs.
    #[serde(default)]
    pub pool: PoolConfig,

    /// The managed keys, in registration order.
    ///
    /// Order matters: the weighted round-robin selector walks keys in the
    /// order they appear here.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}
