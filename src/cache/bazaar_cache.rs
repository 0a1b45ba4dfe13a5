//! Bazaar flip cache with live subscriber feeds.
//!
//! Two pieces of shared state, both swapped atomically and never locked:
//! - the snapshot of the last completed cycle (`get`)
//! - the subscriber set for the *next* cycle (`subscribe` / `unsubscribe`)
//!
//! A refresh cycle swaps the subscriber set for an empty one and keeps the
//! old set as its fixed audience. Every flip the pipeline produces is offered
//! to each audience feed without blocking (dropped when a feed is full) and
//! folded into a new snapshot. When the pipeline ends the snapshot is
//! published and the audience feeds are closed. On failure the feeds are
//! closed and the old snapshot stays.
//!
//! A feed subscribed while a cycle runs is not part of that cycle's audience:
//! it only sees flips from the next cycle, and should read `get()` for what
//! it missed.

use arc_swap::ArcSwap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use super::{is_expired, mono_now_ns, poll_period, NEVER};
use crate::config::BazaarCacheConfig;
use crate::flippers::FlipSource;
use crate::models::{CacheSnapshot, FoundFlip};

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<FoundFlip>>,
}

/// Copy-on-write list; a new `Arc` per membership change
type SubscriberSet = Vec<Subscriber>;

/// Receiving end of one subscription.
///
/// Yields the flips of exactly one refresh cycle, then closes. Resubscribe for
/// the next cycle. Hand it back to [`BazaarCache::unsubscribe`] if you stop
/// reading before it closes.
#[derive(Debug)]
pub struct FlipFeed {
    id: u64,
    rx: mpsc::Receiver<Arc<FoundFlip>>,
}

impl FlipFeed {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next flip, or `None` once the cycle closed the feed
    pub async fn recv(&mut self) -> Option<Arc<FoundFlip>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<FoundFlip>, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// What a call to [`BazaarCache::refresh`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another cycle held the update claim
    Skipped,
    /// Pipeline failed; previous snapshot kept
    Failed { closed_feeds: usize },
    Published { flips: usize, closed_feeds: usize },
}

pub struct BazaarCache {
    snapshot: ArcSwap<CacheSnapshot>,
    subscribers: ArcSwap<SubscriberSet>,
    source: Arc<dyn FlipSource>,
    config: BazaarCacheConfig,
    last_update_ns: AtomicU64,
    updating: AtomicBool,
    next_subscriber_id: AtomicU64,
    completed_cycles: AtomicU64,
}

/// Releases the update claim when the cycle ends, however it ends
struct UpdateClaim<'a>(&'a AtomicBool);

impl Drop for UpdateClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BazaarCache {
    /// Empty cache without a refresh task; drive it with [`refresh`](Self::refresh).
    pub fn new(source: Arc<dyn FlipSource>, config: BazaarCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(CacheSnapshot::new()),
            subscribers: ArcSwap::from_pointee(SubscriberSet::new()),
            source,
            config,
            last_update_ns: AtomicU64::new(NEVER),
            updating: AtomicBool::new(false),
            next_subscriber_id: AtomicU64::new(1),
            completed_cycles: AtomicU64::new(0),
        })
    }

    /// Cache plus its background refresh task. Keep one per process.
    pub fn spawn(source: Arc<dyn FlipSource>, config: BazaarCacheConfig) -> Arc<Self> {
        let cache = Self::new(source, config);
        cache.start_refresh_loop();
        cache
    }

    /// Check every `expiry / 4`; once `expiry` has passed since the last
    /// cycle started, run a new one. Runs until the runtime shuts down.
    pub fn start_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(poll_period(cache.config.expiry));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                expiry_ms = cache.config.expiry.as_millis() as u64,
                "⏱️ Bazaar cache refresh loop started"
            );

            loop {
                ticker.tick().await;
                if !cache.is_expired() {
                    continue;
                }
                // Cycles run detached so a slow one cannot hold up the ticker;
                // the update claim collapses overlapping ones.
                let cycle = cache.clone();
                tokio::spawn(async move {
                    cycle.refresh().await;
                });
            }
        })
    }

    /// Snapshot of the last completed cycle. Never blocks.
    #[inline]
    pub fn get(&self) -> Arc<CacheSnapshot> {
        self.snapshot.load_full()
    }

    /// Register a feed for the next refresh cycle.
    pub fn subscribe(&self) -> FlipFeed {
        let (tx, rx) = mpsc::channel(self.config.feed_capacity.max(1));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber { id, tx };

        loop {
            let current = self.subscribers.load_full();
            let mut next = SubscriberSet::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(subscriber.clone());

            let total = next.len();
            let previous = self.subscribers.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                debug!(subscriber = id, total, "New subscriber added");
                return FlipFeed { id, rx };
            }
            // Lost the race against another subscribe/unsubscribe/cycle; retry
        }
    }

    /// Remove a feed from the next cycle's audience. No-op if it is not
    /// registered (already captured by a cycle, or unsubscribed twice).
    pub fn unsubscribe(&self, feed: &FlipFeed) {
        loop {
            let current = self.subscribers.load_full();
            let Some(index) = current.iter().position(|s| s.id == feed.id) else {
                return;
            };

            let mut next = SubscriberSet::with_capacity(current.len() - 1);
            next.extend(current[..index].iter().cloned());
            next.extend(current[index + 1..].iter().cloned());

            let total = next.len();
            let previous = self.subscribers.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                debug!(subscriber = feed.id, total, "Subscriber removed");
                return;
            }
        }
    }

    /// Feeds waiting for the next cycle
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }

    pub fn subscriber_ids(&self) -> Vec<u64> {
        self.subscribers.load().iter().map(|s| s.id).collect()
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        is_expired(self.last_update_ns.load(Ordering::Acquire), self.config.expiry)
    }

    /// Cycles that published a snapshot
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::Relaxed)
    }

    /// Run one refresh cycle now, unless one is already running.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Skipping bazaar cache update: an update is already in progress");
            return RefreshOutcome::Skipped;
        }
        let _claim = UpdateClaim(&self.updating);

        info!("🔄 Starting bazaar cache update");
        let started = Instant::now();
        // Stamped at the start so the timer measures from cycle start
        self.last_update_ns.store(mono_now_ns(), Ordering::Release);

        let audience = self.subscribers.swap(Arc::new(SubscriberSet::new()));

        let mut stream = match self
            .source
            .run(self.config.population_thresholds.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "❌ Bazaar cache update failed; keeping previous snapshot");
                let closed_feeds = close_feeds(audience);
                return RefreshOutcome::Failed { closed_feeds };
            }
        };

        let mut next = CacheSnapshot::new();
        let mut counter = 0usize;
        let mut dropped = 0usize;
        while let Some(flip) = stream.recv().await {
            let flip = Arc::new(flip);
            for subscriber in audience.iter() {
                // Full or abandoned feeds lose this flip; the producer never waits
                if subscriber.tx.try_send(flip.clone()).is_err() {
                    dropped += 1;
                }
            }
            next.insert(counter, flip);
            counter += 1;
        }

        let flips = next.len();
        self.snapshot.store(Arc::new(next));
        self.completed_cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            flips,
            dropped_deliveries = dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "✅ Bazaar cache update complete"
        );

        let closed_feeds = close_feeds(audience);
        RefreshOutcome::Published {
            flips,
            closed_feeds,
        }
    }
}

/// Dropping the captured set drops every sender, which closes the feeds.
fn close_feeds(audience: Arc<SubscriberSet>) -> usize {
    let count = audience.len();
    drop(audience);
    if count > 0 {
        info!(feeds = count, "Closed subscriber feeds for this update cycle");
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterThresholds;
    use crate::models::ProductSnapshot;
    use crate::scrapers::MarketError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    struct StubSource {
        flips: usize,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    impl StubSource {
        fn new(flips: usize) -> Self {
            Self {
                flips,
                fail: AtomicBool::new(false),
                gate: None,
            }
        }

        fn gated(flips: usize, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(flips)
            }
        }
    }

    fn flip(i: usize) -> FoundFlip {
        let product = ProductSnapshot {
            product_id: format!("ITEM_{i}"),
            sell_price: 80.0,
            buy_price: 100.0,
            sell_volume: 500,
            buy_volume: 2000,
            sell_moving_week: 10_000,
            buy_moving_week: 10_000,
        };
        FoundFlip::from_product(&product, 19)
    }

    #[async_trait]
    impl FlipSource for StubSource {
        async fn run(
            &self,
            _thresholds: FilterThresholds,
        ) -> Result<mpsc::Receiver<FoundFlip>, MarketError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MarketError::Unsuccessful("bazaar fetch"));
            }
            let (tx, rx) = mpsc::channel(16);
            let flips = self.flips;
            let gate = self.gate.clone();
            tokio::spawn(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                for i in 0..flips {
                    if tx.send(flip(i)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn config(feed_capacity: usize) -> BazaarCacheConfig {
        BazaarCacheConfig {
            expiry: Duration::from_millis(40),
            feed_capacity,
            ..BazaarCacheConfig::default()
        }
    }

    async fn drain(feed: &mut FlipFeed) -> Vec<Arc<FoundFlip>> {
        let mut out = Vec::new();
        while let Some(flip) = timeout(Duration::from_secs(5), feed.recv())
            .await
            .expect("feed never closed")
        {
            out.push(flip);
        }
        out
    }

    #[tokio::test]
    async fn test_get_is_stable_between_cycles() {
        let cache = BazaarCache::new(Arc::new(StubSource::new(3)), config(200));
        cache.refresh().await;

        let a = cache.get();
        let b = cache.get();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_publishes_and_closes_feeds() {
        let cache = BazaarCache::new(Arc::new(StubSource::new(25)), config(200));
        let mut feed = cache.subscribe();
        assert_eq!(cache.subscriber_count(), 1);

        let outcome = cache.refresh().await;
        assert_eq!(
            outcome,
            RefreshOutcome::Published {
                flips: 25,
                closed_feeds: 1
            }
        );

        let received = drain(&mut feed).await;
        assert_eq!(received.len(), 25);
        assert_eq!(cache.get().len(), 25);
        assert_eq!(cache.subscriber_count(), 0, "audience is consumed by the cycle");

        let keys: HashSet<usize> = cache.get().keys().copied().collect();
        assert_eq!(keys, (0..25).collect());
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_snapshot_and_closes_feeds() {
        let source = Arc::new(StubSource::new(4));
        let cache = BazaarCache::new(source.clone(), config(200));
        cache.refresh().await;
        let before = cache.get();

        source.fail.store(true, Ordering::SeqCst);
        let mut feed = cache.subscribe();
        let outcome = cache.refresh().await;

        assert_eq!(outcome, RefreshOutcome::Failed { closed_feeds: 1 });
        assert!(drain(&mut feed).await.is_empty());
        assert!(Arc::ptr_eq(&before, &cache.get()));
        assert_eq!(cache.completed_cycles(), 1);
    }

    #[tokio::test]
    async fn test_full_feed_drops_without_blocking_producer() {
        let cache = BazaarCache::new(Arc::new(StubSource::new(50)), config(5));
        let mut slow = cache.subscribe();

        let outcome = timeout(Duration::from_secs(5), cache.refresh())
            .await
            .expect("producer blocked on a full feed");

        assert_eq!(
            outcome,
            RefreshOutcome::Published {
                flips: 50,
                closed_feeds: 1
            }
        );
        assert_eq!(drain(&mut slow).await.len(), 5);
        assert_eq!(cache.get().len(), 50);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let cache = BazaarCache::new(Arc::new(StubSource::new(1)), config(10));
        let feed = cache.subscribe();
        let other = cache.subscribe();

        cache.unsubscribe(&feed);
        cache.unsubscribe(&feed);

        assert_eq!(cache.subscriber_ids(), vec![other.id()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_unsubscribe_membership() {
        let cache = BazaarCache::new(Arc::new(StubSource::new(0)), config(10));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let feed = cache.subscribe();
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    cache.unsubscribe(&feed);
                    None
                } else {
                    Some(feed)
                }
            }));
        }

        let mut kept = Vec::new();
        for task in tasks {
            if let Some(feed) = task.await.unwrap() {
                kept.push(feed);
            }
        }

        let expected: HashSet<u64> = kept.iter().map(|f| f.id()).collect();
        let ids = cache.subscriber_ids();
        let actual: HashSet<u64> = ids.iter().copied().collect();

        assert_eq!(ids.len(), 32, "no duplicated entries");
        assert_eq!(actual, expected, "no lost entries");
    }

    #[tokio::test]
    async fn test_overlapping_refresh_is_skipped() {
        let gate = Arc::new(Notify::new());
        let cache = BazaarCache::new(Arc::new(StubSource::gated(3, gate.clone())), config(10));

        let running = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        };
        timeout(Duration::from_secs(5), async {
            while !cache.is_updating() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(cache.refresh().await, RefreshOutcome::Skipped);

        gate.notify_one();
        assert_eq!(
            running.await.unwrap(),
            RefreshOutcome::Published {
                flips: 3,
                closed_feeds: 0
            }
        );
        assert!(!cache.is_updating());
    }

    #[tokio::test]
    async fn test_mid_cycle_subscriber_joins_next_cycle() {
        let gate = Arc::new(Notify::new());
        let cache = BazaarCache::new(Arc::new(StubSource::gated(3, gate.clone())), config(10));

        let running = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        };
        timeout(Duration::from_secs(5), async {
            while !cache.is_updating() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let mut late = cache.subscribe();
        gate.notify_one();
        running.await.unwrap();

        // Not in this cycle's audience: nothing delivered, feed still open
        assert!(matches!(
            late.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        assert_eq!(cache.get().len(), 3, "earlier coverage comes from the snapshot");
        assert_eq!(cache.subscriber_ids(), vec![late.id()]);

        let next = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        };
        gate.notify_one();
        next.await.unwrap();
        assert_eq!(drain(&mut late).await.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_loop_runs_on_timer() {
        let cache = BazaarCache::spawn(Arc::new(StubSource::new(2)), config(10));

        timeout(Duration::from_secs(5), async {
            while cache.completed_cycles() < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("refresh loop stalled");

        assert_eq!(cache.get().len(), 2);
    }

    /// Records when each cycle asked the pipeline for flips
    struct StampingSource {
        runs: std::sync::Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl FlipSource for StampingSource {
        async fn run(
            &self,
            _thresholds: FilterThresholds,
        ) -> Result<mpsc::Receiver<FoundFlip>, MarketError> {
            self.runs.lock().unwrap().push(Instant::now());
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_attempts_stay_within_expiry_plus_quarter() {
        let expiry = Duration::from_millis(80);
        let source = Arc::new(StampingSource {
            runs: std::sync::Mutex::new(Vec::new()),
        });
        let cache = BazaarCache::spawn(
            source.clone(),
            BazaarCacheConfig {
                expiry,
                ..config(10)
            },
        );

        sleep(Duration::from_millis(1000)).await;
        let runs = source.runs.lock().unwrap().clone();
        assert!(cache.completed_cycles() >= 5);
        assert!(runs.len() >= 6, "only {} attempts", runs.len());

        // expiry + expiry/4, plus slack for the scheduler
        let bound = expiry + expiry / 4 + Duration::from_millis(30);
        for pair in runs.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap <= bound, "gap {gap:?} exceeds {bound:?}");
        }
    }
}
