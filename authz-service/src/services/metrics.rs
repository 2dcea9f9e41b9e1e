//! Prometheus metrics for authz-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Access decisions by outcome.
pub static ACCESS_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_access_decisions_total",
        "Total number of access decisions",
        &["outcome"] // granted, denied - not entity to keep cardinality bounded
    )
    .expect("Failed to register access_decisions_total")
});

/// Rows written by the default role synchronizer.
pub static SYNC_CHANGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_sync_changes_total",
        "Total number of changes applied by default role synchronization",
        &["kind"]
    )
    .expect("Failed to register sync_changes_total")
});

/// Administrative operations by operation and status.
pub static ADMIN_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_admin_operations_total",
        "Total number of role administration operations",
        &["operation", "status"]
    )
    .expect("Failed to register admin_operations_total")
});

/// Rule snapshot refreshes by status.
pub static SNAPSHOT_REFRESHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_snapshot_refreshes_total",
        "Total number of rule snapshot refreshes",
        &["status"]
    )
    .expect("Failed to register snapshot_refreshes_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "authz_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&ACCESS_DECISIONS_TOTAL);
    Lazy::force(&SYNC_CHANGES_TOTAL);
    Lazy::force(&ADMIN_OPERATIONS_TOTAL);
    Lazy::force(&SNAPSHOT_REFRESHES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Record an access decision.
pub fn record_access_decision(granted: bool) {
    let outcome = if granted { "granted" } else { "denied" };
    ACCESS_DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record `count` synchronizer changes of the given kind.
pub fn record_sync_changes(kind: &str, count: usize) {
    if count > 0 {
        SYNC_CHANGES_TOTAL
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }
}

/// Record an administration operation result.
pub fn record_admin_operation(operation: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    ADMIN_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a snapshot refresh result.
pub fn record_snapshot_refresh(ok: bool) {
    let status = if ok { "ok" } else { "error" };
    SNAPSHOT_REFRESHES_TOTAL.with_label_values(&[status]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
