//! bzflip - Hypixel bazaar flip finder
//!
//! Refreshes the bazaar flip cache on a timer and serves it over HTTP:
//!   GET /api/bzflips           SSE backlog + live flips
//!   GET /api/bzflips/snapshot  filtered snapshot as JSON
//!   GET /health
//!
//! Environment:
//!   HYPIXEL_API_KEY        - Hypixel API key (required)
//!   PRICE_HISTORY_URL      - Price tracker base URL; product id is appended (required)
//!   BAZAAR_URL             - Bazaar endpoint (default: Hypixel v2)
//!   BIND_ADDR              - Listen address (default: 0.0.0.0:3000)
//!   CACHE_EXPIRY_SECS      - Refresh interval (default: 20)
//!   HTTP_TIMEOUT_SECS      - Upstream request deadline (default: 5)
//!   THRESHOLDS_PATH        - Per-user thresholds TOML (optional)
//!   THRESHOLDS_RELOAD_SECS - Thresholds file reload interval (default: 60)
//!   CORS_ORIGIN            - Allowed browser origin (default: http://localhost:8080)
//!   LOG_FILE               - Also append logs to this file (optional, e.g. logs/app.log)

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    middleware,
};
use clap::Parser;
use dotenv::dotenv;
use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bzflip_backend::{
    api::{create_router, AppState},
    cache::{BazaarCache, ProcessSlot},
    config::{
        BazaarCacheConfig, FileThresholdsProvider, PipelineConfig, StaticThresholdsProvider,
        ThresholdsProvider,
    },
    flippers::BazaarFlipper,
    scrapers::{hypixel_bazaar::HYPIXEL_BAZAAR_URL, HypixelBazaarClient},
};

static BAZAAR_CACHE: ProcessSlot<BazaarCache> = ProcessSlot::new("bazaar cache");

#[derive(Parser, Debug)]
#[command(name = "bzflip")]
#[command(about = "Hypixel bazaar flip finder")]
struct Args {
    /// Hypixel API key
    #[arg(long, env = "HYPIXEL_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Bazaar snapshot endpoint
    #[arg(long, env = "BAZAAR_URL", default_value = HYPIXEL_BAZAAR_URL)]
    bazaar_url: String,

    /// Price history base URL (product id is appended)
    #[arg(long, env = "PRICE_HISTORY_URL")]
    price_history_url: String,

    /// Address to serve the API on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind_addr: SocketAddr,

    /// Seconds between cache refresh cycles
    #[arg(long, env = "CACHE_EXPIRY_SECS", default_value = "20")]
    cache_expiry_secs: u64,

    /// Deadline for every upstream request, in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "5")]
    http_timeout_secs: u64,

    /// Per-user thresholds file (TOML); built-in defaults when absent
    #[arg(long, env = "THRESHOLDS_PATH")]
    thresholds_path: Option<PathBuf>,

    /// Seconds between thresholds file reloads
    #[arg(long, env = "THRESHOLDS_RELOAD_SECS", default_value = "60")]
    thresholds_reload_secs: u64,

    /// Browser origin allowed by CORS
    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:8080")]
    cors_origin: String,

    /// Copy of the log output, appended (stdout logging stays on)
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    // Held until exit so buffered file lines get flushed
    let _log_guard = init_tracing(args.log_file.as_deref())?;

    info!("🚀 bzflip starting");
    info!("  Bazaar: {}", args.bazaar_url);
    info!("  Price history: {}", args.price_history_url);
    info!("  Refresh every {}s", args.cache_expiry_secs);

    let client = HypixelBazaarClient::new(
        &args.api_key,
        args.bazaar_url.clone(),
        args.price_history_url.clone(),
        Duration::from_secs(args.http_timeout_secs),
    )?;
    client
        .verify_key()
        .await
        .context("Hypixel API key check failed")?;

    let flipper = BazaarFlipper::with_price_history(Arc::new(client), PipelineConfig::default());

    let cache = BAZAAR_CACHE.install(BazaarCache::spawn(
        Arc::new(flipper),
        BazaarCacheConfig {
            expiry: Duration::from_secs(args.cache_expiry_secs.max(1)),
            ..BazaarCacheConfig::default()
        },
    ))?;

    let thresholds: Arc<dyn ThresholdsProvider> = match &args.thresholds_path {
        Some(path) => Arc::new(
            FileThresholdsProvider::load(
                path.clone(),
                Duration::from_secs(args.thresholds_reload_secs.max(1)),
            )
            .await
            .context("Failed to load thresholds file")?,
        ),
        None => {
            info!("📋 No thresholds file; every user gets the defaults");
            Arc::new(StaticThresholdsProvider(Default::default()))
        }
    };

    let cors = CorsLayer::new()
        .allow_origin(
            args.cors_origin
                .parse::<HeaderValue>()
                .context("Invalid CORS_ORIGIN")?,
        )
        .allow_methods([Method::GET]);

    let app = create_router(AppState { cache, thresholds })
        .layer(middleware::from_fn(bzflip_backend::middleware::request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = TcpListener::bind(args.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind_addr))?;
    info!("🎯 API server listening on {}", args.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

/// Stdout logging, plus a plain-text copy in `log_file` when given
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = open_log_file(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bzflip_backend=info,bzflip=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn open_log_file(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("LOG_FILE {} has no file name", path.display()))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(
        tracing_appender::rolling::never(dir, name),
    ))
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
