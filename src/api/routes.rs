use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::stream::{filtered_snapshot, user_flip_stream};
use crate::cache::BazaarCache;
use crate::config::ThresholdsProvider;
use crate::models::FoundFlip;

/// Header carrying the caller's thresholds key
pub const USER_KEY_HEADER: &str = "x-user-key";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<BazaarCache>,
    pub thresholds: Arc<dyn ThresholdsProvider>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/bzflips", get(stream_flips))
        .route("/api/bzflips/snapshot", get(get_snapshot))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        snapshot_size: state.cache.get().len(),
        subscribers: state.cache.subscriber_count(),
    })
}

/// SSE: the caller's filtered backlog, then the next cycle's live flips
async fn stream_flips(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let user = user_key(&headers, &params);
    let thresholds = state.thresholds.thresholds(&user).await?;
    debug!(user = %user, "Opening flip stream");

    let events = user_flip_stream(state.cache.clone(), thresholds)
        .map(|flip| Event::default().json_data(&*flip));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// The caller's filtered view of the last completed cycle
async fn get_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UserQuery>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let user = user_key(&headers, &params);
    let thresholds = state.thresholds.thresholds(&user).await?;

    let flips: Vec<FoundFlip> = filtered_snapshot(&state.cache.get(), &thresholds)
        .iter()
        .map(|flip| (**flip).clone())
        .collect();

    Ok(Json(SnapshotResponse {
        count: flips.len(),
        flips,
        subscribers: state.cache.subscriber_count(),
        completed_cycles: state.cache.completed_cycles(),
        updating: state.cache.is_updating(),
    }))
}

/// Header wins over the query parameter; empty means the default thresholds
fn user_key(headers: &HeaderMap, params: &UserQuery) -> String {
    headers
        .get(USER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.user.clone())
        .unwrap_or_default()
}

// ===== Request/Response Types =====

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub snapshot_size: usize,
    pub subscribers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub count: usize,
    pub flips: Vec<FoundFlip>,
    pub subscribers: usize,
    pub completed_cycles: u64,
    pub updating: bool,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Thresholds(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Thresholds(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Thresholds(err) => {
                tracing::error!("Thresholds lookup failed: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Could not resolve filter thresholds".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BazaarCacheConfig, FilterThresholds, StaticThresholdsProvider};
    use crate::flippers::FlipSource;
    use crate::models::ProductSnapshot;
    use crate::scrapers::MarketError;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct TwoFlips;

    #[async_trait]
    impl FlipSource for TwoFlips {
        async fn run(
            &self,
            _thresholds: FilterThresholds,
        ) -> Result<mpsc::Receiver<FoundFlip>, MarketError> {
            let (tx, rx) = mpsc::channel(4);
            for (id, buy_price, profit) in [("CHEAP", 100.0, 19), ("PRICEY", 200.0, 118)] {
                let product = ProductSnapshot {
                    product_id: id.to_string(),
                    sell_price: 80.0,
                    buy_price,
                    sell_volume: 500,
                    buy_volume: 2000,
                    sell_moving_week: 10_000,
                    buy_moving_week: 10_000,
                };
                let _ = tx.try_send(FoundFlip::from_product(&product, profit));
            }
            Ok(rx)
        }
    }

    /// Key "picky" needs 50 coins of profit, everyone else 10
    struct PerUser;

    #[async_trait]
    impl ThresholdsProvider for PerUser {
        async fn thresholds(&self, user_key: &str) -> anyhow::Result<FilterThresholds> {
            let min_profit = if user_key == "picky" { 50 } else { 10 };
            Ok(FilterThresholds {
                min_profit,
                min_profit_percentage: 0.0,
                min_buy_volume: 0,
                ..FilterThresholds::default()
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl ThresholdsProvider for Broken {
        async fn thresholds(&self, _user_key: &str) -> anyhow::Result<FilterThresholds> {
            anyhow::bail!("thresholds store unavailable")
        }
    }

    async fn state(thresholds: Arc<dyn ThresholdsProvider>) -> AppState {
        let cache = BazaarCache::new(Arc::new(TwoFlips), BazaarCacheConfig::default());
        cache.refresh().await;
        AppState { cache, thresholds }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        router: Router,
        request: Request<Body>,
    ) -> (StatusCode, T) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_snapshot_and_subscribers() {
        let state = state(Arc::new(PerUser)).await;
        let _feed = state.cache.subscribe();
        let router = create_router(state);

        let (status, health): (_, HealthResponse) = get_json(
            router,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.snapshot_size, 2);
        assert_eq!(health.subscribers, 1);
    }

    #[tokio::test]
    async fn test_snapshot_uses_header_user_thresholds() {
        let router = create_router(state(Arc::new(PerUser)).await);

        let (_, everyone): (_, SnapshotResponse) = get_json(
            router.clone(),
            Request::get("/api/bzflips/snapshot").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(everyone.count, 2);
        assert_eq!(everyone.completed_cycles, 1);

        let (_, picky): (_, SnapshotResponse) = get_json(
            router,
            Request::get("/api/bzflips/snapshot")
                .header(USER_KEY_HEADER, "picky")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(picky.count, 1);
        assert_eq!(picky.flips[0].product_id, "PRICEY");
        assert_eq!(picky.flips[0].command, "/bzs PRICEY");
    }

    #[tokio::test]
    async fn test_snapshot_user_from_query() {
        let router = create_router(state(Arc::new(PerUser)).await);

        let (_, picky): (_, SnapshotResponse) = get_json(
            router,
            Request::get("/api/bzflips/snapshot?user=picky")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(picky.count, 1);
    }

    #[tokio::test]
    async fn test_thresholds_failure_is_500() {
        let router = create_router(state(Arc::new(Broken)).await);

        let (status, body): (_, serde_json::Value) = get_json(
            router,
            Request::get("/api/bzflips/snapshot").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Could not resolve filter thresholds");
    }

    #[tokio::test]
    async fn test_stream_endpoint_is_event_stream() {
        let state = state(Arc::new(StaticThresholdsProvider(FilterThresholds::default()))).await;
        let cache = state.cache.clone();
        let router = create_router(state);

        let response = router
            .oneshot(Request::get("/api/bzflips").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        assert_eq!(cache.subscriber_count(), 1);

        drop(response);
        assert_eq!(cache.subscriber_count(), 0);
    }
}
