//! Router configuration for the web server.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Payloads carry base64 images, well past axum's 2 MB default.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Input and single-batch operations
        .route("/api/upload", post(handlers::upload))
        .route("/api/submit-batch", post(handlers::submit_batch))
        .route(
            "/api/batch-status",
            get(handlers::batch_status).post(handlers::batch_action),
        )
        .route("/api/download-results", get(handlers::download_results))
        // Results
        .route("/api/extract-images", post(handlers::extract))
        .route("/api/save-and-extract", post(handlers::save_and_extract))
        .route(
            "/api/download-all-images",
            get(handlers::download_all_images),
        )
        .route("/api/image-dates", get(handlers::image_dates))
        // Pipeline control
        .route(
            "/api/pipeline",
            get(handlers::status).post(handlers::init),
        )
        .route("/api/pipeline/start", post(handlers::start))
        .route("/api/pipeline/pause", post(handlers::pause))
        .route("/api/pipeline/resume", post(handlers::resume))
        .route("/api/pipeline/stop", post(handlers::stop))
        .route("/api/logs", get(handlers::logs))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
