//! Thresholds, tuning knobs, and the per-user thresholds provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};

use crate::cache::ExpiringCache;

/// One week, the manipulation-check lookback
pub const PRICE_HISTORY_WINDOW: Duration = Duration::from_secs(3600 * 24 * 7);

/// Caller-owned criteria a product must clear to count as a flip.
///
/// One default instance populates the cache; per-user instances filter
/// cached flips on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterThresholds {
    pub min_profit: i64,
    pub min_profit_percentage: f64,
    pub min_buy_volume: i64,
    pub min_volume_diff: i64,
    pub min_buy_moving_week: i64,
    pub min_sell_moving_week: i64,
    /// Substrings; a product whose id contains any of them is skipped
    pub exclude_items: Vec<String>,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            min_profit: 1000,
            min_profit_percentage: 20.0,
            min_buy_volume: 1000,
            min_volume_diff: 0,
            min_buy_moving_week: 0,
            min_sell_moving_week: 0,
            exclude_items: Vec::new(),
        }
    }
}

/// Flip pipeline sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent manipulation checkers
    pub workers: usize,
    /// Filtered products waiting for a worker
    pub candidate_capacity: usize,
    /// Found flips waiting for the consumer
    pub result_capacity: usize,
    pub history_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            candidate_capacity: 150,
            result_capacity: 200,
            history_window: PRICE_HISTORY_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BazaarCacheConfig {
    pub expiry: Duration,
    /// Per-subscriber live feed buffer; flips beyond this are dropped
    pub feed_capacity: usize,
    /// Thresholds used to populate the cache (users filter on top)
    pub population_thresholds: FilterThresholds,
}

impl Default for BazaarCacheConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(20),
            feed_capacity: 200,
            population_thresholds: FilterThresholds::default(),
        }
    }
}

// =============================================================================
// THRESHOLDS PROVIDER
// =============================================================================

/// Resolves the thresholds a delivery request should filter with.
/// Never consulted by the cache itself.
#[async_trait]
pub trait ThresholdsProvider: Send + Sync {
    async fn thresholds(&self, user_key: &str) -> Result<FilterThresholds>;
}

/// Same thresholds for every caller
pub struct StaticThresholdsProvider(pub FilterThresholds);

#[async_trait]
impl ThresholdsProvider for StaticThresholdsProvider {
    async fn thresholds(&self, _user_key: &str) -> Result<FilterThresholds> {
        Ok(self.0.clone())
    }
}

/// Contents of a thresholds TOML file:
///
/// ```toml
/// [default]
/// min_profit = 1000
///
/// [users.some-key]
/// min_profit = 5000
/// exclude_items = ["COBBLE"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThresholdsBook {
    pub default: FilterThresholds,
    pub users: HashMap<String, FilterThresholds>,
}

impl ThresholdsBook {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid thresholds file")
    }

    pub fn lookup(&self, user_key: &str) -> &FilterThresholds {
        self.users.get(user_key).unwrap_or(&self.default)
    }
}

/// File-backed provider, reloaded in the background every `reload` interval.
/// A failed reload keeps serving the last good book.
pub struct FileThresholdsProvider {
    book: Arc<ExpiringCache<ThresholdsBook>>,
}

impl FileThresholdsProvider {
    /// Fails if the file cannot be read or parsed on the first attempt.
    pub async fn load(path: PathBuf, reload: Duration) -> Result<Self> {
        let source = path.clone();
        let book = ExpiringCache::create(
            reload,
            move || {
                let path = source.clone();
                async move {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    ThresholdsBook::parse(&raw)
                }
            },
            |e: &anyhow::Error| error!(error = %e, "Thresholds reload failed; keeping previous"),
        )
        .await?;

        info!(
            path = %path.display(),
            users = book.get().users.len(),
            "📋 Thresholds loaded"
        );
        Ok(Self { book })
    }
}

#[async_trait]
impl ThresholdsProvider for FileThresholdsProvider {
    async fn thresholds(&self, user_key: &str) -> Result<FilterThresholds> {
        Ok(self.book.get().lookup(user_key).clone())
    }
}
