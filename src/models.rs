use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Divisor turning a moving-week volume into a daily rate (7 days + slack).
pub const VOLUME_AVERAGE_CHECK: i64 = 8;

/// Share of the daily buy volume we recommend flipping (1%)
pub const RECOMMENDED_BUY_PERCENTAGE: f64 = 0.01;

/// Bazaar sales tax in percent
pub const BAZAAR_TAX: f64 = 1.25;

/// Current bazaar stats for one product. Immutable per fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub product_id: String,
    pub sell_price: f64,
    pub buy_price: f64,
    pub sell_volume: i64,
    pub buy_volume: i64,
    pub sell_moving_week: i64,
    pub buy_moving_week: i64,
}

/// One point of a product's price history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub buy: f64,
    pub sell: f64,
}

/// A filtered, non-manipulated product plus the numbers a flipper needs.
///
/// The serialized field set is the contract with stream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundFlip {
    pub product_id: String,
    pub command: String,
    pub profit: i64,
    pub sell_price: f64,
    pub buy_price: f64,
    pub sell_volume: i64,
    pub sell_moving_week: i64,
    pub buy_volume: i64,
    pub buy_moving_week: i64,
    pub recommended_flip_volume: i64,
    pub profit_from_recommended_flip_volume: i64,
}

impl FoundFlip {
    /// Build a flip from a product that already passed filtering and the
    /// manipulation check. `profit` is the taxed per-unit spread.
    pub fn from_product(product: &ProductSnapshot, profit: i64) -> Self {
        let recommended_flip_volume = recommended_flip_volume(product.buy_moving_week);
        Self {
            product_id: product.product_id.clone(),
            command: format!("/bzs {}", product.product_id),
            profit,
            sell_price: product.sell_price,
            buy_price: product.buy_price,
            sell_volume: product.sell_volume,
            sell_moving_week: product.sell_moving_week,
            buy_volume: product.buy_volume,
            buy_moving_week: product.buy_moving_week,
            recommended_flip_volume,
            profit_from_recommended_flip_volume: profit * recommended_flip_volume,
        }
    }
}

/// `floor(buyMovingWeek / 8 * 1%)`, with the daily rate in whole units first
pub fn recommended_flip_volume(buy_moving_week: i64) -> i64 {
    ((buy_moving_week / VOLUME_AVERAGE_CHECK) as f64 * RECOMMENDED_BUY_PERCENTAGE).floor() as i64
}

/// Result set of one refresh cycle, keyed by arrival index.
/// Replaced wholesale, never mutated after publication.
pub type CacheSnapshot = HashMap<usize, Arc<FoundFlip>>;

/// Read access to the stats the static filter looks at.
///
/// Implemented by raw products (cache population) and by found flips
/// (per-user filtering of cached results).
pub trait MarketStats {
    fn product_id(&self) -> &str;
    fn sell_price(&self) -> f64;
    fn buy_price(&self) -> f64;
    fn sell_volume(&self) -> i64;
    fn buy_volume(&self) -> i64;
    fn sell_moving_week(&self) -> i64;
    fn buy_moving_week(&self) -> i64;
}

macro_rules! impl_market_stats {
    ($ty:ty) => {
        impl MarketStats for $ty {
            #[inline]
            fn product_id(&self) -> &str {
                &self.product_id
            }
            #[inline]
            fn sell_price(&self) -> f64 {
                self.sell_price
            }
            #[inline]
            fn buy_price(&self) -> f64 {
                self.buy_price
            }
            #[inline]
            fn sell_volume(&self) -> i64 {
                self.sell_volume
            }
            #[inline]
            fn buy_volume(&self) -> i64 {
                self.buy_volume
            }
            #[inline]
            fn sell_moving_week(&self) -> i64 {
                self.sell_moving_week
            }
            #[inline]
            fn buy_moving_week(&self) -> i64 {
                self.buy_moving_week
            }
        }
    };
}

impl_market_stats!(ProductSnapshot);
impl_market_stats!(FoundFlip);

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> ProductSnapshot {
        ProductSnapshot {
            product_id: "ENCHANTED_DIAMOND".to_string(),
            sell_price: 80.0,
            buy_price: 100.0,
            sell_volume: 500,
            buy_volume: 2000,
            sell_moving_week: 10_000,
            buy_moving_week: 10_000,
        }
    }

    #[test]
    fn test_found_flip_derived_fields() {
        let flip = FoundFlip::from_product(&product(), 19);

        assert_eq!(flip.command, "/bzs ENCHANTED_DIAMOND");
        // 10_000 / 8 = 1250 per day, 1% of that = 12.5 -> 12
        assert_eq!(flip.recommended_flip_volume, 12);
        assert_eq!(flip.profit_from_recommended_flip_volume, 19 * 12);
    }

    #[test]
    fn test_recommended_volume_truncates_daily_rate_first() {
        // 815 / 8 = 101 (integer), 1.01 -> 1
        assert_eq!(recommended_flip_volume(815), 1);
        assert_eq!(recommended_flip_volume(799), 0);
    }

    #[test]
    fn test_found_flip_wire_names() {
        let flip = FoundFlip::from_product(&product(), 19);
        let json = serde_json::to_value(&flip).unwrap();

        for key in [
            "productId",
            "command",
            "profit",
            "sellPrice",
            "buyPrice",
            "sellVolume",
            "sellMovingWeek",
            "buyVolume",
            "buyMovingWeek",
            "recommendedFlipVolume",
            "profitFromRecommendedFlipVolume",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
