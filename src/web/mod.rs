//! HTTP surface: run submission, run snapshots, the per-run event stream and
//! the CSV export.

pub mod error;
pub mod handlers;

pub use error::{ErrorResponse, WebError};

use crate::config::StreamConfig;
use crate::runner::RunOrchestrator;
use crate::storage::RunStore;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RunOrchestrator,
    pub stream: StreamConfig,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator, stream: StreamConfig) -> Self {
        Self {
            orchestrator,
            stream,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.orchestrator.store()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::healthcheck))
        .route("/api/methods", get(handlers::list_methods))
        .route("/api/runs", post(handlers::create_run))
        .route("/api/runs/:run_id", get(handlers::get_run))
        .route("/api/runs/:run_id/events", get(handlers::stream_events))
        .route("/api/runs/:run_id/csv", get(handlers::export_csv))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
