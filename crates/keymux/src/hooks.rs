//! Operator callback hooks.
//!
//! Hooks are invoked synchronously from the dispatch path, after the
//! registry lock has been released. A panicking hook is caught, logged and
//! swallowed: operator instrumentation must never corrupt dispatching.

use std::panic::{AssertUnwindSafe, catch_unwind};

type WarningHook = Box<dyn Fn(&str, f64) + Send + Sync>;
type KeyHook = Box<dyn Fn(&str) + Send + Sync>;
type PoolHook = Box<dyn Fn() + Send + Sync>;

/// Optional callbacks fired on pool state transitions.
#[derive(Default)]
pub struct PoolHooks {
    on_warning: Option<WarningHook>,
    on_key_exhausted: Option<KeyHook>,
    on_key_circuit_open: Option<KeyHook>,
    on_all_keys_exhausted: Option<PoolHook>,
}

impl PoolHooks {
    /// Start building a hook set.
    pub fn builder() -> PoolHooksBuilder {
        PoolHooksBuilder {
            hooks: Self::default(),
        }
    }

    /// A key crossed the quota warning threshold for the first time this
    /// period. `usage` is the fraction of the limit consumed.
    pub(crate) fn warning(&self, key_id: &str, usage: f64) {
        if let Some(hook) = &self.on_warning {
            guard("on_warning", || hook(key_id, usage));
        }
    }

    /// A key's quota just ran out.
    pub(crate) fn key_exhausted(&self, key_id: &str) {
        if let Some(hook) = &self.on_key_exhausted {
            guard("on_key_exhausted", || hook(key_id));
        }
    }

    /// A key's circuit transitioned into open.
    pub(crate) fn key_circuit_open(&self, key_id: &str) {
        if let Some(hook) = &self.on_key_circuit_open {
            guard("on_key_circuit_open", || hook(key_id));
        }
    }

    /// A request found no eligible key at all.
    pub(crate) fn all_keys_exhausted(&self) {
        if let Some(hook) = &self.on_all_keys_exhausted {
            guard("on_all_keys_exhausted", || hook());
        }
    }
}

fn guard(name: &str, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        log::warn!("{name} hook panicked; ignoring");
    }
}

/// Builder for [`PoolHooks`].
pub struct PoolHooksBuilder {
    hooks: PoolHooks,
}

impl PoolHooksBuilder {
    /// Called with the key id and usage fraction the first time a key
    /// crosses the warning threshold within a quota period.
    pub fn on_warning(mut self, hook: impl Fn(&str, f64) + Send + Sync + 'static) -> Self {
        self.hooks.on_warning = Some(Box::new(hook));
        self
    }

    /// Called when a key's quota runs out.
    pub fn on_key_exhausted(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.on_key_exhausted = Some(Box::new(hook));
        self
    }

    /// Called when a key's circuit opens.
    pub fn on_key_circuit_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.on_key_circuit_open = Some(Box::new(hook));
        self
    }

    /// Called each time a request fails to find any eligible key.
    pub fn on_all_keys_exhausted(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_all_keys_exhausted = Some(Box::new(hook));
        self
    }

    /// Finish building.
    pub fn build(self) -> PoolHooks {
        self.hooks
    }
}
