use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use sqlx::PgPool;
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use common_observability::LedgerMetrics;
use stock_service::{
    app, db, ledger, AppState, RealtimePublisher, DEFAULT_AUDIT_SWEEP_SECS,
    DEFAULT_LOCK_TIMEOUT_MS,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db_pool = PgPool::connect(&database_url).await?;
    db::ensure_schema(&db_pool).await?;

    let lock_timeout_ms = env::var("LOCK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    let audit_sweep = env::var("LEDGER_AUDIT_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_AUDIT_SWEEP_SECS));

    let metrics = Arc::new(LedgerMetrics::new());
    let state = AppState {
        db: db_pool.clone(),
        realtime: RealtimePublisher::from_env(),
        metrics: metrics.clone(),
        lock_timeout_ms,
        audit_sweep,
    };

    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-device-id"),
        ]);

    let router = app(state.clone()).layer(cors);

    spawn_ledger_audit_sweeper(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting stock-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

fn spawn_ledger_audit_sweeper(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(state.audit_sweep).await;
            match ledger::audit_and_heal(&state.db, &state.metrics).await {
                Ok(0) => {}
                Ok(healed) => tracing::info!(healed, "ledger audit healed diverged stock counters"),
                Err(err) => tracing::error!(?err, "ledger audit sweep error"),
            }
        }
    });
}
