use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    middleware,
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, TextEncoder};
use sqlx::PgPool;

use common_observability::LedgerMetrics;

pub mod db;
pub mod ledger;
pub mod movement;
pub mod realtime;
pub mod stock_handlers;
pub mod sync_handlers;

pub use movement::{apply_movement, Direction, LedgerError, MovementEvent};
pub use realtime::RealtimePublisher;
pub use sync_handlers::{normalize_events, run_sync_batch, SyncRequest};

pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 5_000;
pub const DEFAULT_AUDIT_SWEEP_SECS: u64 = 300;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub realtime: RealtimePublisher,
    pub metrics: Arc<LedgerMetrics>,
    pub lock_timeout_ms: i64,
    pub audit_sweep: Duration,
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> (axum::http::StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {e}"),
        );
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buf).to_string(),
    )
}

// Error metrics middleware using dedicated state (Arc<LedgerMetrics>) passed via from_fn_with_state.
async fn error_metrics_mw(
    State(metrics): State<Arc<LedgerMetrics>>,
    req: axum::http::Request<Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp
            .headers()
            .get("x-error-code")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        metrics
            .http_errors_total
            .with_label_values(&["stock-service", code, status.as_str()])
            .inc();
    }
    resp
}

/// Full service router minus transport-level layers (CORS is added in main).
pub fn app(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route("/healthz", get(health))
        .route("/sync", post(sync_handlers::submit_sync))
        .route("/stock-in", post(stock_handlers::stock_in))
        .route("/stock-out", post(stock_handlers::stock_out))
        .route("/products/:id/stock", get(stock_handlers::get_product_stock))
        .route("/products/:id/movements", get(stock_handlers::list_product_movements))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(middleware::from_fn_with_state(metrics, error_metrics_mw))
}
