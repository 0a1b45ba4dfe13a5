//! Static threshold filter shared by cache population and per-user reads.
//!
//! Checks run in a fixed order and the first failing one decides; there is no
//! compound scoring.

use std::fmt;

use crate::config::FilterThresholds;
use crate::models::{MarketStats, BAZAAR_TAX, VOLUME_AVERAGE_CHECK};

/// Minimum daily-normalized volume (exclusive) on both sides of the book
const MIN_DAILY_VOLUME: i64 = 10;

/// Which check turned a product away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Excluded,
    MinProfit,
    MinProfitPercentage,
    MinBuyVolume,
    MinVolumeDiff,
    MinMovingWeek,
    LowDailyVolume,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excluded => "EXCLUDED_ITEMS",
            Self::MinProfit => "MIN_PROFIT",
            Self::MinProfitPercentage => "MIN_PROFIT_%",
            Self::MinBuyVolume => "MIN_BUY_VOL",
            Self::MinVolumeDiff => "MIN_BUY_VOL_DIFF",
            Self::MinMovingWeek => "MIN_BUY_/_SELL_WEEK",
            Self::LowDailyVolume => "MIN_DAILY_BUY_/_SELL_WEEK",
        };
        f.write_str(s)
    }
}

/// What a passing product earns per unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterPass {
    /// Taxed spread, `(buy - sell) * (1 - tax)`
    pub profit: f64,
}

impl FilterPass {
    /// Whole-coin profit as carried on a `FoundFlip`
    #[inline]
    pub fn whole_profit(&self) -> i64 {
        self.profit as i64
    }
}

/// Taxed per-unit spread between buy and sell price
#[inline]
pub fn taxed_profit(buy_price: f64, sell_price: f64) -> f64 {
    let tax_factor = 1.0 - BAZAAR_TAX / 100.0; // 0.9875 at 1.25%
    (buy_price - sell_price) * tax_factor
}

/// Run every check in order against `item`.
pub fn evaluate<P: MarketStats + ?Sized>(
    item: &P,
    thresholds: &FilterThresholds,
) -> Result<FilterPass, Rejection> {
    // "COBBLE" excludes COBBLESTONE, ENCHANTED_COBBLESTONE, ...
    if is_excluded(item.product_id(), thresholds) {
        return Err(Rejection::Excluded);
    }

    let profit = taxed_profit(item.buy_price(), item.sell_price());
    if profit < thresholds.min_profit as f64 {
        return Err(Rejection::MinProfit);
    }

    let profit_percentage = profit / item.sell_price() * 100.0;
    if profit_percentage < thresholds.min_profit_percentage {
        return Err(Rejection::MinProfitPercentage);
    }

    let buy_volume = item.buy_volume();
    let sell_volume = item.sell_volume();
    if buy_volume < thresholds.min_buy_volume {
        return Err(Rejection::MinBuyVolume);
    }
    if buy_volume - sell_volume < thresholds.min_volume_diff {
        return Err(Rejection::MinVolumeDiff);
    }

    let buy_moving_week = item.buy_moving_week();
    let sell_moving_week = item.sell_moving_week();
    if buy_moving_week < thresholds.min_buy_moving_week
        || sell_moving_week < thresholds.min_sell_moving_week
    {
        return Err(Rejection::MinMovingWeek);
    }

    if buy_moving_week / VOLUME_AVERAGE_CHECK <= MIN_DAILY_VOLUME
        || sell_moving_week / VOLUME_AVERAGE_CHECK <= MIN_DAILY_VOLUME
    {
        return Err(Rejection::LowDailyVolume);
    }

    Ok(FilterPass { profit })
}

#[inline]
pub fn passes<P: MarketStats + ?Sized>(item: &P, thresholds: &FilterThresholds) -> bool {
    evaluate(item, thresholds).is_ok()
}

fn is_excluded(product_id: &str, thresholds: &FilterThresholds) -> bool {
    thresholds
        .exclude_items
        .iter()
        .any(|excluded| !excluded.is_empty() && product_id.contains(excluded.as_str()))
}
