pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod jobs;
pub mod kv;
pub mod models;
pub mod server;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::jobs::CrawlService;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<CrawlService>,
}

pub fn build_app(state: AppState) -> Router {
    // CORS layer — permissive, the stream is consumed cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/jobs",
            post(server::routes::create_job).get(server::routes::list_jobs),
        )
        .route("/jobs/{id}/state", get(server::routes::job_state))
        .route("/jobs/{id}/stream", get(server::routes::stream_job))
        .route("/jobs/{id}/download", get(server::routes::download))
        .route("/jobs/{id}/cancel", post(server::routes::cancel_job))
        .route(
            "/internal/jobs/{id}/worker",
            post(server::routes::run_worker),
        )
        .route("/health", get(server::routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
