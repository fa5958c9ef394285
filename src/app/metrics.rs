//! Prometheus-based metrics module
//!
//! Aggregated per-kind error counters, traffic totals and session gauges.
//! Everything registers against one process-wide registry.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::error::Error;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total sessions accepted
    pub static ref SESSIONS_TOTAL: IntCounter = IntCounter::new(
        "eagletun_sessions_total",
        "Total number of accepted sessions"
    ).unwrap();

    /// Currently active sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "eagletun_sessions_active",
        "Number of currently active sessions"
    ).unwrap();

    /// Sessions refused by the admission cap
    pub static ref SESSIONS_OVER_CAP: IntCounter = IntCounter::new(
        "eagletun_sessions_over_cap_total",
        "Sessions dropped because the concurrency cap was reached"
    ).unwrap();

    /// Total bytes client → origin
    pub static ref TRAFFIC_BYTES_UP: IntCounter = IntCounter::new(
        "eagletun_traffic_bytes_up_total",
        "Total bytes relayed from clients to origins"
    ).unwrap();

    /// Total bytes origin → client
    pub static ref TRAFFIC_BYTES_DOWN: IntCounter = IntCounter::new(
        "eagletun_traffic_bytes_down_total",
        "Total bytes relayed from origins to clients"
    ).unwrap();

    /// Errors by kind
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("eagletun_errors_total", "Errors by kind"),
        &["kind"]
    ).unwrap();
}

/// Register all metrics with the global registry.
pub fn init_metrics() {
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_OVER_CAP.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UP.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWN.clone())).ok();
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).ok();
}

/// Count one error under its taxonomy kind.
pub fn record_error(err: &Error) {
    ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
}
