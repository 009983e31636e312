//! HTTP adapter over the stack service.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use smctf_core::{ApiKeyConfig, StackService};
use tower_http::trace::TraceLayer;

use crate::middleware::api_key_guard;

pub mod error;
pub mod handlers;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StackService>,
}

/// Build the API router.
pub fn router(service: Arc<StackService>, api_key: ApiKeyConfig) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/stacks", post(handlers::create_stack).get(handlers::list_stacks))
        .route(
            "/stacks/batch-delete",
            post(handlers::create_batch_delete_job),
        )
        .route(
            "/stacks/batch-delete/:job_id",
            get(handlers::get_batch_delete_job),
        )
        .route(
            "/stacks/:stack_id",
            get(handlers::get_stack).delete(handlers::delete_stack),
        )
        .route("/stacks/:stack_id/status", get(handlers::get_stack_status))
        .route("/stats", get(handlers::get_stats))
        .layer(middleware::from_fn_with_state(api_key, api_key_guard))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}
