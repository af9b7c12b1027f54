//! HTTP adapter over the run controller.

pub mod handlers;

use crate::controller::RunController;
use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
}

impl AppState {
    #[must_use]
    pub fn new(controller: Arc<RunController>) -> Self {
        Self { controller }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/system/health", get(handlers::health))
        .route("/system/hardware", get(handlers::hardware))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/start", post(handlers::start_run))
        .route("/runs/:id", get(handlers::get_run))
        .route("/runs/:id/metrics", get(handlers::run_metrics))
        .route("/runs/:id/checkpoints", get(handlers::run_checkpoints))
        .route("/runs/:id/cancel", post(handlers::cancel_run))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(address = %listener.local_addr()?, "Fine-tune engine listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}
