//! Generic "compute on a timer, read lock-free" container.

use anyhow::Result;
use arc_swap::ArcSwap;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::{is_expired, mono_now_ns, poll_period};

/// Holds the latest value produced by an update function.
///
/// Readers never wait on the refresh task: [`get`](Self::get) is an atomic
/// pointer load. A failed update keeps the previous value.
pub struct ExpiringCache<T> {
    data: ArcSwap<T>,
    expiry: Duration,
    last_update_ns: AtomicU64,
}

impl<T: Send + Sync + 'static> ExpiringCache<T> {
    /// Run `update_fn` once and, if it succeeds, start the refresh task.
    ///
    /// The task checks every `expiry / 4` and calls `update_fn` once `expiry`
    /// has elapsed since the last attempt. Failures go to `on_error` and the
    /// old value stays. The task runs for the rest of the process, so create
    /// one cache per dataset.
    pub async fn create<F, Fut, E>(
        expiry: Duration,
        update_fn: F,
        on_error: E,
    ) -> Result<Arc<Self>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        E: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        let initial = update_fn().await?;

        let cache = Arc::new(Self {
            data: ArcSwap::from_pointee(initial),
            expiry,
            last_update_ns: AtomicU64::new(mono_now_ns()),
        });

        let worker = cache.clone();
        tokio::spawn(async move { worker.manage(update_fn, on_error).await });

        Ok(cache)
    }

    /// Latest stored value
    #[inline]
    pub fn get(&self) -> Arc<T> {
        self.data.load_full()
    }

    async fn manage<F, Fut, E>(self: Arc<Self>, update_fn: F, on_error: E)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        E: Fn(&anyhow::Error),
    {
        let mut ticker = interval(poll_period(self.expiry));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !is_expired(self.last_update_ns.load(Ordering::Acquire), self.expiry) {
                continue;
            }

            let result = update_fn().await;
            // Stamp even on failure so a broken source is retried per expiry, not per tick
            self.last_update_ns.store(mono_now_ns(), Ordering::Release);

            match result {
                Ok(value) => {
                    self.data.store(Arc::new(value));
                    debug!("Expiring cache refreshed");
                }
                Err(e) => on_error(&e),
            }
        }
    }
}
