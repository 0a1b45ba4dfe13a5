//! Bazaar flip pipeline.
//!
//! fetch snapshot -> static filter -> bounded candidate queue -> worker pool
//! (manipulation checks) -> bounded result stream
//!
//! The coordinator closes the candidate queue once every product has been
//! walked, waits for the workers, and only then lets the result stream close.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration, time::Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::{filter, FlipSource, ManipulationDetector, PriceHistoryDetector};
use crate::config::{FilterThresholds, PipelineConfig};
use crate::models::{FoundFlip, ProductSnapshot};
use crate::scrapers::{MarketError, MarketplaceClient};

/// A product that passed the static filter
#[derive(Debug)]
struct Candidate {
    product: ProductSnapshot,
    profit: i64,
}

pub struct BazaarFlipper {
    client: Arc<dyn MarketplaceClient>,
    detector: Arc<dyn ManipulationDetector>,
    config: PipelineConfig,
}

impl BazaarFlipper {
    pub fn new(
        client: Arc<dyn MarketplaceClient>,
        detector: Arc<dyn ManipulationDetector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            detector,
            config,
        }
    }

    /// Pipeline whose manipulation checks use the same client's price history
    pub fn with_price_history(client: Arc<dyn MarketplaceClient>, config: PipelineConfig) -> Self {
        let detector = Arc::new(PriceHistoryDetector::new(client.clone()));
        Self::new(client, detector, config)
    }
}

#[async_trait]
impl FlipSource for BazaarFlipper {
    async fn run(
        &self,
        thresholds: FilterThresholds,
    ) -> Result<mpsc::Receiver<FoundFlip>, MarketError> {
        let snapshot = self.client.fetch_snapshot().await?;

        let (candidate_tx, candidate_rx) =
            mpsc::channel::<Candidate>(self.config.candidate_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel::<FoundFlip>(self.config.result_capacity.max(1));

        let shared_rx = Arc::new(Mutex::new(candidate_rx));
        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            workers.spawn(check_candidates(
                worker,
                shared_rx.clone(),
                result_tx.clone(),
                self.detector.clone(),
                self.config.history_window,
            ));
        }
        // Workers hold the only senders: the stream closes when the last one exits
        drop(result_tx);

        tokio::spawn(async move {
            let filtering = Instant::now();
            let total = snapshot.products.len();
            let mut queued = 0usize;

            for product in snapshot.products {
                let pass = match filter::evaluate(&product, &thresholds) {
                    Ok(pass) => pass,
                    Err(rejection) => {
                        trace!(product_id = %product.product_id, %rejection, "Filtered out");
                        continue;
                    }
                };
                let candidate = Candidate {
                    profit: pass.whole_profit(),
                    product,
                };
                if candidate_tx.send(candidate).await.is_err() {
                    warn!("All flip workers exited early; abandoning filter walk");
                    break;
                }
                queued += 1;
            }
            drop(candidate_tx);

            info!(
                products = total,
                candidates = queued,
                elapsed_ms = filtering.elapsed().as_millis() as u64,
                "🔎 Filtering products done"
            );

            let checking = Instant::now();
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Flip worker aborted");
                }
            }

            info!(
                elapsed_ms = checking.elapsed().as_millis() as u64,
                "🛡️ Manipulation checks finished (estimated)"
            );
        });

        Ok(result_rx)
    }
}

async fn check_candidates(
    worker: usize,
    candidates: Arc<Mutex<mpsc::Receiver<Candidate>>>,
    results: mpsc::Sender<FoundFlip>,
    detector: Arc<dyn ManipulationDetector>,
    window: Duration,
) {
    loop {
        let next = { candidates.lock().await.recv().await };
        let Some(candidate) = next else {
            break;
        };

        match detector.is_manipulated(&candidate.product, window).await {
            Ok(false) => {
                let flip = FoundFlip::from_product(&candidate.product, candidate.profit);
                if results.send(flip).await.is_err() {
                    debug!(worker, "Flip stream dropped by consumer");
                    break;
                }
            }
            Ok(true) => {
                debug!(
                    worker,
                    product_id = %candidate.product.product_id,
                    "Suspected market manipulation"
                );
            }
            Err(e) => {
                debug!(
                    worker,
                    product_id = %candidate.product.product_id,
                    error = %e,
                    "Manipulation check failed; skipping"
                );
            }
        }
    }
}
