//! Metrics module for usage-engine.
//! Provides Prometheus metrics for fact writes, aggregation queries and errors,
//! plus the recorder behind the HTTP request metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "usage_db_query_duration_seconds",
            "Database query duration",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Appended fact rows by table
pub static EVENTS_APPENDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Aggregation queries by target and path
pub static ANALYTICS_QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recorder for metrics emitted through the `metrics` facade.
pub static RECORDER_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    EVENTS_APPENDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_events_appended_total",
                "Total fact rows appended by table"
            ),
            &["table"]
        )
        .expect("Failed to register EVENTS_APPENDED_TOTAL")
    });

    ANALYTICS_QUERIES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_analytics_queries_total",
                "Total aggregation queries by target and path"
            ),
            &["target", "path"]
        )
        .expect("Failed to register ANALYTICS_QUERIES_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("usage_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;

    install_recorder();
}

fn install_recorder() {
    if RECORDER_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = RECORDER_HANDLE.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "Metrics recorder already installed"),
    }
}

/// Get metrics in Prometheus text format: the registry followed by the
/// recorder's output.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    let mut body = String::from_utf8(buffer).unwrap_or_default();
    if let Some(handle) = RECORDER_HANDLE.get() {
        body.push_str(&handle.render());
    }
    body
}

/// Record appended fact rows.
pub fn record_events_appended(table: &str, rows: usize) {
    if let Some(counter) = EVENTS_APPENDED_TOTAL.get() {
        counter.with_label_values(&[table]).inc_by(rows as u64);
    }
}

/// Record an aggregation query.
pub fn record_analytics_query(target: &str, path: &str) {
    if let Some(counter) = ANALYTICS_QUERIES_TOTAL.get() {
        counter.with_label_values(&[target, path]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
