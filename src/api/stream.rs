//! Per-user views over the bazaar cache.
//!
//! The cache is populated with loose thresholds; every read re-applies the
//! caller's own thresholds on top of it.

use futures_util::stream::{self, Stream, StreamExt};
use std::sync::Arc;

use crate::cache::{BazaarCache, FlipFeed};
use crate::config::FilterThresholds;
use crate::flippers::filter;
use crate::models::{CacheSnapshot, FoundFlip};

/// Cached flips that pass `thresholds`, in the order the cycle found them
pub fn filtered_snapshot(
    snapshot: &CacheSnapshot,
    thresholds: &FilterThresholds,
) -> Vec<Arc<FoundFlip>> {
    let mut entries: Vec<(&usize, &Arc<FoundFlip>)> = snapshot
        .iter()
        .filter(|(_, flip)| filter::passes::<FoundFlip>(flip, thresholds))
        .collect();
    entries.sort_unstable_by_key(|(index, _)| **index);
    entries.into_iter().map(|(_, flip)| flip.clone()).collect()
}

/// Unsubscribes its feed when the stream holding it is dropped
struct FeedGuard {
    cache: Arc<BazaarCache>,
    feed: FlipFeed,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.cache.unsubscribe(&self.feed);
    }
}

/// Backlog from the current snapshot, then the next cycle's live flips.
///
/// Ends when that cycle closes the feed. The subscription is taken before
/// the snapshot is read, so a cycle finishing in between is covered by one
/// side or the other.
pub fn user_flip_stream(
    cache: Arc<BazaarCache>,
    thresholds: FilterThresholds,
) -> impl Stream<Item = Arc<FoundFlip>> + Send + 'static {
    let feed = cache.subscribe();
    let backlog = filtered_snapshot(&cache.get(), &thresholds);
    let guard = FeedGuard { cache, feed };

    let live = stream::unfold((guard, thresholds), |(mut guard, thresholds)| async move {
        loop {
            let flip = guard.feed.recv().await?;
            if filter::passes::<FoundFlip>(&flip, &thresholds) {
                return Some((flip, (guard, thresholds)));
            }
        }
    });

    stream::iter(backlog).chain(live)
}
