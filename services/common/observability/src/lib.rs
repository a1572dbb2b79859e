use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};

#[derive(Clone)]
pub struct LedgerMetrics {
    pub registry: Registry,
    pub sync_batches_total: IntCounter,
    pub sync_batch_replays_total: IntCounter,
    pub movement_events_applied_total: IntCounterVec,
    pub movement_events_failed_total: IntCounterVec,
    pub realtime_publish_failures: IntCounter,
    pub ledger_divergence: IntCounter,
    pub sync_batch_duration_seconds: Histogram,
    pub heal_latency_seconds: Histogram,
    pub http_errors_total: IntCounterVec,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let sync_batches_total = IntCounter::new(
            "sync_batches_total",
            "Sync batches processed (excluding replays)",
        ).unwrap();
        let sync_batch_replays_total = IntCounter::new(
            "sync_batch_replays_total",
            "Duplicate sync batches answered from the stored response",
        ).unwrap();
        let movement_events_applied_total = IntCounterVec::new(
            prometheus::Opts::new(
                "movement_events_applied_total",
                "Stock movement events applied, by direction"
            ),
            &["direction"]
        ).unwrap();
        let movement_events_failed_total = IntCounterVec::new(
            prometheus::Opts::new(
                "movement_events_failed_total",
                "Stock movement events rejected, by error code"
            ),
            &["code"]
        ).unwrap();
        let realtime_publish_failures = IntCounter::new(
            "realtime_publish_failures_total",
            "Best-effort realtime publishes that failed",
        ).unwrap();
        let ledger_divergence = IntCounter::new(
            "ledger_divergence_total",
            "Stock counter vs ledger aggregation divergences detected",
        ).unwrap();
        let sync_batch_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "sync_batch_duration_seconds",
                "Duration of a sync batch, normalization through commit"
            ).buckets(vec![0.01,0.05,0.1,0.25,0.5,1.0,2.0,5.0])
        ).unwrap();
        let heal_latency_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "ledger_heal_latency_seconds",
                "Time spent healing a diverged stock counter"
            ).buckets(vec![0.001,0.005,0.01,0.05,0.1,0.25,0.5])
        ).unwrap();
        let http_errors_total = IntCounterVec::new(
            prometheus::Opts::new(
                "http_errors_total",
                "Count of HTTP error responses emitted (status >= 400)"
            ),
            &["service", "code", "status"]
        ).unwrap();
        let _ = registry.register(Box::new(sync_batches_total.clone()));
        let _ = registry.register(Box::new(sync_batch_replays_total.clone()));
        let _ = registry.register(Box::new(movement_events_applied_total.clone()));
        let _ = registry.register(Box::new(movement_events_failed_total.clone()));
        let _ = registry.register(Box::new(realtime_publish_failures.clone()));
        let _ = registry.register(Box::new(ledger_divergence.clone()));
        let _ = registry.register(Box::new(sync_batch_duration_seconds.clone()));
        let _ = registry.register(Box::new(heal_latency_seconds.clone()));
        let _ = registry.register(Box::new(http_errors_total.clone()));
        LedgerMetrics {
            registry,
            sync_batches_total,
            sync_batch_replays_total,
            movement_events_applied_total,
            movement_events_failed_total,
            realtime_publish_failures,
            ledger_divergence,
            sync_batch_duration_seconds,
            heal_latency_seconds,
            http_errors_total,
        }
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self { Self::new() }
}
