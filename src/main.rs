use docspasta::config::Config;
use docspasta::jobs::CrawlService;
use docspasta::kv::{MemoryKv, RedisKv, SharedKv};
use docspasta::{build_app, AppState};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter (defaults to "info")
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config =
        Arc::new(Config::from_env().expect("Failed to load configuration from environment"));
    let port = config.port;

    let kv: SharedKv = match config.redis_url.as_deref() {
        Some(url) => {
            let store = RedisKv::connect(url, config.kv_op_timeout)
                .await
                .expect("Failed to connect to Redis");
            tracing::info!("Using Redis-backed store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set; using in-process store (single node only)");
            Arc::new(MemoryKv::new())
        }
    };

    let service = CrawlService::new(kv, config.clone());

    let state = AppState {
        config: config.clone(),
        service,
    };

    let app = build_app(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Crawler service starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
