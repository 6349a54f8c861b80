//! Health check endpoint.

use axum::{routing::get, Json, Router};
use kenpos_engine::HealthResponse;

use crate::AppState;

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn root() -> &'static str {
    "KenPOS Sync Server"
}
