//! Prometheus metrics for the Gatehouse server
//!
//! Exports metrics for:
//! - Listener admission and flood rejections
//! - Session lifecycle and outcomes
//! - Request serializer throughput, errors and queue depth
//! - Connection pool size and connect failures

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════
// LISTENER METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Connection attempts by outcome (accepted, flood_rejected, handshake_failed)
pub static CONNECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gatehouse_connections_total",
        "Client connection attempts by outcome",
        &["outcome"]
    )
    .expect("gatehouse_connections_total registers once")
});

/// Times the accept loop paused at the connection ceiling
pub static ADMISSION_BLOCKED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatehouse_admission_blocked_total",
        "Times the accept loop paused at the connection ceiling"
    )
    .expect("gatehouse_admission_blocked_total registers once")
});

// ═══════════════════════════════════════════════════════════════════════════
// SESSION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Sessions currently running
pub static SESSIONS_ACTIVE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("gatehouse_sessions_active", "Sessions currently running")
        .expect("gatehouse_sessions_active registers once")
});

/// Finished sessions by end reason
pub static SESSIONS_ENDED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gatehouse_sessions_ended_total",
        "Finished sessions by end reason",
        &["reason"]
    )
    .expect("gatehouse_sessions_ended_total registers once")
});

/// Refused credential checks
pub static AUTH_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatehouse_auth_failures_total",
        "Refused credential checks"
    )
    .expect("gatehouse_auth_failures_total registers once")
});

// ═══════════════════════════════════════════════════════════════════════════
// DATABASE METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Executed operations by serializer kind and status
pub static EXECUTION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gatehouse_execution_seconds",
        "Database operation latency by serializer kind and status",
        &["kind", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .expect("gatehouse_execution_seconds registers once")
});

/// Callers that gave up waiting for a result
pub static WAIT_TIMEOUTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gatehouse_wait_timeouts_total",
        "Callers that gave up waiting for a database result",
        &["kind"]
    )
    .expect("gatehouse_wait_timeouts_total registers once")
});

/// Distinct operations waiting for the worker
pub static PENDING_REQUESTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "gatehouse_pending_requests",
        "Distinct operations waiting for the serializer worker",
        &["kind"]
    )
    .expect("gatehouse_pending_requests registers once")
});

/// Idle connections in the pool
pub static POOL_IDLE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("gatehouse_pool_idle_connections", "Idle connections in the pool")
        .expect("gatehouse_pool_idle_connections registers once")
});

/// Failed connection attempts by the pool filler
pub static POOL_CONNECT_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gatehouse_pool_connect_failures_total",
        "Failed connection attempts by the pool filler"
    )
    .expect("gatehouse_pool_connect_failures_total registers once")
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    let _ = &*CONNECTIONS_TOTAL;
    let _ = &*ADMISSION_BLOCKED_TOTAL;
    let _ = &*SESSIONS_ACTIVE;
    let _ = &*SESSIONS_ENDED_TOTAL;
    let _ = &*AUTH_FAILURES_TOTAL;
    let _ = &*EXECUTION_SECONDS;
    let _ = &*WAIT_TIMEOUTS_TOTAL;
    let _ = &*PENDING_REQUESTS;
    let _ = &*POOL_IDLE;
    let _ = &*POOL_CONNECT_FAILURES_TOTAL;

    for kind in ["sql", "procedure"] {
        PENDING_REQUESTS.with_label_values(&[kind]).set(0.0);
    }
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_connection(outcome: &str) {
    CONNECTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_admission_blocked() {
    ADMISSION_BLOCKED_TOTAL.inc();
}

pub fn session_opened() {
    SESSIONS_ACTIVE.inc();
}

pub fn session_closed(reason: &str) {
    SESSIONS_ACTIVE.dec();
    SESSIONS_ENDED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_auth_failure() {
    AUTH_FAILURES_TOTAL.inc();
}

/// Record one executed operation
pub fn record_execution(kind: &str, status: &str, duration_secs: f64) {
    EXECUTION_SECONDS
        .with_label_values(&[kind, status])
        .observe(duration_secs);
}

pub fn record_wait_timeout(kind: &str) {
    WAIT_TIMEOUTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn set_pending(kind: &str, pending: usize) {
    PENDING_REQUESTS.with_label_values(&[kind]).set(pending as f64);
}

pub fn set_pool_idle(idle: usize) {
    POOL_IDLE.set(idle as f64);
}

pub fn record_pool_connect_failure() {
    POOL_CONNECT_FAILURES_TOTAL.inc();
}
