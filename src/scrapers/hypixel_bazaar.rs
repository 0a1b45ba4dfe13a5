//! Hypixel Skyblock bazaar REST client.
//!
//! Two endpoints are consumed:
//! - the bazaar snapshot (`quick_status` per product)
//! - a price tracker returning `RFC3339 timestamp -> {b, s}` per product

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration, time::Instant};
use tracing::{debug, info, warn};

use super::{MarketError, MarketSnapshot, MarketplaceClient};
use crate::models::{PriceHistoryPoint, ProductSnapshot};

pub const HYPIXEL_BAZAAR_URL: &str = "https://api.hypixel.net/v2/skyblock/bazaar";

/// Not a real v2 endpoint; the 404 reply still says whether the key is valid
pub const HYPIXEL_KEY_CHECK_URL: &str = "https://api.hypixel.net/v2/key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BazaarResponse {
    success: bool,
    #[serde(default)]
    last_updated: i64,
    #[serde(default)]
    products: HashMap<String, BazaarProduct>,
}

#[derive(Debug, Deserialize)]
struct BazaarProduct {
    #[serde(default)]
    product_id: String,
    quick_status: QuickStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickStatus {
    sell_price: f64,
    sell_volume: i64,
    sell_moving_week: i64,
    buy_price: f64,
    buy_volume: i64,
    buy_moving_week: i64,
}

#[derive(Debug, Deserialize)]
struct KeyCheckReply {
    success: bool,
    #[serde(default)]
    cause: String,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "b")]
    buy: f64,
    #[serde(rename = "s")]
    sell: f64,
}

/// One client per API key; cheap to clone.
#[derive(Clone)]
pub struct HypixelBazaarClient {
    client: Client,
    bazaar_url: String,
    history_base_url: String,
}

impl HypixelBazaarClient {
    /// `timeout` bounds every upstream call so a stuck request cannot stall
    /// a refresh cycle.
    pub fn new(
        api_key: &str,
        bazaar_url: impl Into<String>,
        history_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    "API-Key",
                    api_key.parse().context("Invalid Hypixel api key")?,
                );
                headers
            })
            .build()
            .context("Failed to build HypixelBazaarClient")?;

        Ok(Self {
            client,
            bazaar_url: bazaar_url.into(),
            history_base_url: history_base_url.into(),
        })
    }

    /// Fails with [`MarketError::InvalidApiKey`] when Hypixel rejects the key.
    /// Meant to run once at startup, before any refresh cycle.
    pub async fn verify_key(&self) -> Result<(), MarketError> {
        // Status is ignored: the check URL answers non-2xx for valid keys too
        let body = self.client.get(HYPIXEL_KEY_CHECK_URL).send().await?.bytes().await?;
        let reply: KeyCheckReply = serde_json::from_slice(&body)?;
        check_key_reply(reply)?;

        info!("🔑 Hypixel API key is valid");
        Ok(())
    }

    async fn checked_get(&self, url: &str) -> Result<reqwest::Response, MarketError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(url, "Upstream returned 500 (likely rate limited)");
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MarketError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl MarketplaceClient for HypixelBazaarClient {
    async fn fetch_snapshot(&self) -> Result<MarketSnapshot, MarketError> {
        let started = Instant::now();
        let body = self.checked_get(&self.bazaar_url).await?.bytes().await?;
        let resp: BazaarResponse = serde_json::from_slice(&body)?;
        let snapshot = parse_bazaar(resp)?;

        info!(
            products = snapshot.products.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "📦 Bazaar snapshot fetched"
        );
        Ok(snapshot)
    }

    async fn fetch_history(
        &self,
        product_id: &str,
        window: Duration,
    ) -> Result<Vec<PriceHistoryPoint>, MarketError> {
        let url = format!("{}{}", self.history_base_url, product_id);
        let body = self.checked_get(&url).await?.bytes().await?;
        let raw: HashMap<String, HistoryEntry> = serde_json::from_slice(&body)?;
        let points = parse_history(raw)?;
        let retained = retain_window(points, window, Utc::now());

        debug!(product_id, points = retained.len(), "Price history fetched");
        Ok(retained)
    }
}

fn check_key_reply(reply: KeyCheckReply) -> Result<(), MarketError> {
    if !reply.success && reply.cause.contains("Invalid") {
        return Err(MarketError::InvalidApiKey(reply.cause));
    }
    Ok(())
}

fn parse_bazaar(resp: BazaarResponse) -> Result<MarketSnapshot, MarketError> {
    if !resp.success {
        return Err(MarketError::Unsuccessful("bazaar fetch"));
    }

    let products = resp
        .products
        .into_iter()
        .map(|(key, p)| {
            let product_id = if p.product_id.is_empty() {
                key
            } else {
                p.product_id
            };
            let q = p.quick_status;
            ProductSnapshot {
                product_id,
                sell_price: q.sell_price,
                buy_price: q.buy_price,
                sell_volume: q.sell_volume,
                buy_volume: q.buy_volume,
                sell_moving_week: q.sell_moving_week,
                buy_moving_week: q.buy_moving_week,
            }
        })
        .collect();

    Ok(MarketSnapshot {
        last_updated: resp.last_updated,
        products,
    })
}

/// Sort timestamp keys chronologically and parse them; any malformed key
/// fails the whole history.
fn parse_history(
    raw: HashMap<String, HistoryEntry>,
) -> Result<Vec<PriceHistoryPoint>, MarketError> {
    let mut points = raw
        .into_iter()
        .map(|(ts, entry)| {
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|_| MarketError::InvalidTimestamp(ts.clone()))?
                .with_timezone(&Utc);
            Ok(PriceHistoryPoint {
                timestamp,
                buy: entry.buy,
                sell: entry.sell,
            })
        })
        .collect::<Result<Vec<_>, MarketError>>()?;

    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

/// Keep the suffix of an oldest-first series whose age is within `window`.
///
/// Walks forward from the oldest point and stops at the first one whose age
/// is `<= window`; that point and everything after it is retained.
pub fn retain_window(
    points: Vec<PriceHistoryPoint>,
    window: Duration,
    now: DateTime<Utc>,
) -> Vec<PriceHistoryPoint> {
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    let first_recent = points
        .iter()
        .position(|p| now.signed_duration_since(p.timestamp) <= window)
        .unwrap_or(points.len());
    points.into_iter().skip(first_recent).collect()
}
