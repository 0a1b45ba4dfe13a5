//! Marketplace data sources.
//!
//! The flip pipeline only talks to [`MarketplaceClient`]; the Hypixel REST
//! implementation lives in [`hypixel_bazaar`].

pub mod hypixel_bazaar;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::{PriceHistoryPoint, ProductSnapshot};

pub use hypixel_bazaar::HypixelBazaarClient;

/// Errors from the upstream marketplace
#[derive(Debug, Error)]
pub enum MarketError {
    /// Network failure, timeout, or an unreadable body
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Response arrived but reported `success: false`
    #[error("{0} not successful")]
    Unsuccessful(&'static str),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("could not parse price history timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("no price history within window for {0}")]
    EmptyHistory(String),

    #[error("Hypixel rejected the API key: {0}")]
    InvalidApiKey(String),
}

/// One full bazaar fetch
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub last_updated: i64,
    pub products: Vec<ProductSnapshot>,
}

/// Upstream marketplace API as consumed by the flip pipeline
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// Fetch current stats for every product.
    async fn fetch_snapshot(&self) -> Result<MarketSnapshot, MarketError>;

    /// Fetch the chronologically ordered price history of `product_id`,
    /// restricted to the trailing `window`.
    async fn fetch_history(
        &self,
        product_id: &str,
        window: Duration,
    ) -> Result<Vec<PriceHistoryPoint>, MarketError>;
}
