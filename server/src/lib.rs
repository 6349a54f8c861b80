//! KenPOS Server - replication endpoint for KenPOS terminals.
//!
//! The server is one more replica of the document store. Terminals pull its
//! change feed and push their own revisions; conflicts are resolved here the
//! same way they are on the terminals, so every replica converges.

mod auth;
pub mod config;
pub mod error;
mod routes;

use std::sync::Arc;

use axum::Router;
use kenpos_store::DocumentStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use crate::config::{Config, ConfigError};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: DocumentStore,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: DocumentStore, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

/// Build the router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
