//! Flip finding: static filter, manipulation check, and the pipeline that
//! fans products out to checkers and streams the survivors.

pub mod bazaar_flipper;
pub mod filter;
pub mod manipulation;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::FilterThresholds;
use crate::models::FoundFlip;
use crate::scrapers::MarketError;

pub use bazaar_flipper::BazaarFlipper;
pub use manipulation::{ManipulationDetector, PriceHistoryDetector};

/// Something that turns thresholds into a finite stream of flips.
///
/// Fetch-time failures are returned before any streaming starts. Once a
/// receiver is handed out it is closed when the run is complete, so callers
/// must drain it to the end.
#[async_trait]
pub trait FlipSource: Send + Sync {
    async fn run(
        &self,
        thresholds: FilterThresholds,
    ) -> Result<mpsc::Receiver<FoundFlip>, MarketError>;
}
