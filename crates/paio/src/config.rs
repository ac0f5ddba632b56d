//! Watcher configuration.
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! Environment variables (all optional):
//! - `PAIO_SWAP_SIZE` - internal swap buffer capacity in bytes (per slab)
//! - `PAIO_MAX_EVENTS` - max kernel events drained per poller wakeup

use std::str::FromStr;

/// Default capacity of each internal swap slab (two are allocated).
pub const DEFAULT_SWAP_SIZE: usize = 64 * 1024;

/// Default cap on kernel events drained per poller wakeup.
pub const DEFAULT_MAX_EVENTS: usize = 4096;

/// Get environment variable parsed as type T, or return the default.
#[inline]
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tunables for a [`Watcher`](crate::Watcher), builder style.
///
/// `from_env()` starts from library defaults and applies any environment
/// overrides; the builder methods win over both.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Capacity of each internal swap slab, used by reads that supply
    /// no buffer of their own.
    pub swap_capacity: usize,
    /// Max kernel readiness events drained per poller wakeup.
    pub max_events: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WatcherConfig {
    /// Library defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            swap_capacity: env_get("PAIO_SWAP_SIZE", DEFAULT_SWAP_SIZE).max(1),
            max_events: env_get("PAIO_MAX_EVENTS", DEFAULT_MAX_EVENTS).max(1),
        }
    }

    pub fn swap_capacity(mut self, bytes: usize) -> Self {
        self.swap_capacity = bytes.max(1);
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }
}
