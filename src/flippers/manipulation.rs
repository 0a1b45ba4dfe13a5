//! Market manipulation detection.
//!
//! A product is flagged when its sell price swung hard over the lookback
//! window while current volume is thin compared to its weekly average.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

use crate::models::{PriceHistoryPoint, ProductSnapshot, VOLUME_AVERAGE_CHECK};
use crate::scrapers::{MarketError, MarketplaceClient};

/// Swing (percent of midpoint) above which a thin market is suspicious
pub const MAX_SWING_PERCENTAGE: f64 = 40.0;

#[async_trait]
pub trait ManipulationDetector: Send + Sync {
    async fn is_manipulated(
        &self,
        product: &ProductSnapshot,
        window: Duration,
    ) -> Result<bool, MarketError>;
}

/// Detector backed by the marketplace price history
pub struct PriceHistoryDetector {
    client: Arc<dyn MarketplaceClient>,
}

impl PriceHistoryDetector {
    pub fn new(client: Arc<dyn MarketplaceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManipulationDetector for PriceHistoryDetector {
    async fn is_manipulated(
        &self,
        product: &ProductSnapshot,
        window: Duration,
    ) -> Result<bool, MarketError> {
        let points = self
            .client
            .fetch_history(&product.product_id, window)
            .await?;
        if points.is_empty() {
            return Err(MarketError::EmptyHistory(product.product_id.clone()));
        }
        Ok(is_manipulated_by_history(product, &points))
    }
}

/// `(max - min) / midpoint * 100` over the history's sell prices, with the
/// current sell price included in the range.
pub fn swing_percentage(current_sell: f64, points: &[PriceHistoryPoint]) -> f64 {
    let (min, max) = points
        .iter()
        .fold((current_sell, current_sell), |(lo, hi), p| {
            (lo.min(p.sell), hi.max(p.sell))
        });

    let midpoint = (max + min) / 2.0;
    if midpoint == 0.0 {
        return 0.0;
    }
    (max - min) / midpoint * 100.0
}

/// Large swing plus abnormally low volume on either side.
pub fn is_manipulated_by_history(product: &ProductSnapshot, points: &[PriceHistoryPoint]) -> bool {
    let swing = swing_percentage(product.sell_price, points);

    let low_sell_volume = product.sell_volume < product.sell_moving_week / VOLUME_AVERAGE_CHECK;
    let low_buy_volume = product.buy_volume < product.buy_moving_week / VOLUME_AVERAGE_CHECK;

    swing > MAX_SWING_PERCENTAGE && (low_sell_volume || low_buy_volume)
}
