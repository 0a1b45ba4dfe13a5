//! Compute-once, serve-many caches.
//!
//! - [`ExpiringCache`]: generic value refreshed on a timer
//! - [`BazaarCache`]: flip snapshot plus live per-subscriber feeds
//!
//! Both are meant to live for the whole process. Their refresh tasks have no
//! cancellation, so create exactly one per dataset (see [`ProcessSlot`]).

pub mod bazaar_cache;
pub mod expiring;

use anyhow::{bail, Result};
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

pub use bazaar_cache::{BazaarCache, FlipFeed, RefreshOutcome};
pub use expiring::ExpiringCache;

/// Sentinel for "never refreshed"
const NEVER: u64 = u64::MAX;

/// Process-relative monotonic nanosecond timestamp
#[inline(always)]
fn mono_now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Whether `expiry` has passed since `last_ns` (a [`mono_now_ns`] reading)
#[inline]
fn is_expired(last_ns: u64, expiry: Duration) -> bool {
    if last_ns == NEVER {
        return true;
    }
    mono_now_ns().saturating_sub(last_ns) >= expiry.as_nanos() as u64
}

/// Poll cadence for a refresh loop: a quarter of the expiry, which bounds
/// how late a refresh can start to 25% of `expiry`.
#[inline]
fn poll_period(expiry: Duration) -> Duration {
    (expiry / 4).max(Duration::from_millis(1))
}

/// Init-once holder for a process-wide cache instance.
///
/// `install` succeeds exactly once; later calls fail instead of silently
/// starting a second refresh task. Tests should build their own instances
/// rather than go through a slot.
pub struct ProcessSlot<T> {
    name: &'static str,
    cell: OnceLock<Arc<T>>,
}

impl<T> ProcessSlot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceLock::new(),
        }
    }

    pub fn install(&self, value: Arc<T>) -> Result<Arc<T>> {
        if self.cell.set(value.clone()).is_err() {
            bail!("{} already initialised for this process", self.name);
        }
        Ok(value)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }
}
