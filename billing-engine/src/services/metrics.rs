//! Metrics module for billing-engine.
//! Provides Prometheus metrics for billing runs, charges and notifications.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_gauge, register_histogram_vec, register_int_counter_vec,
    Encoder, Gauge, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Billing runs by final status
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Gateway charge attempts by outcome
pub static CHARGE_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Charged amounts in minor units by currency and outcome
pub static CHARGE_AMOUNT_MINOR_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Failure ratio of the most recent completed run
pub static LAST_RUN_FAILURE_RATIO: OnceLock<Gauge> = OnceLock::new();

/// Notification dispatch by kind and outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_runs_total", "Total billing runs by status"),
            &["status", "dry_run"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    CHARGE_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_charge_attempts_total",
                "Total gateway charge attempts by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register CHARGE_ATTEMPTS_TOTAL")
    });

    CHARGE_AMOUNT_MINOR_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_charge_amount_minor_total",
                "Total charged amount in minor currency units"
            ),
            &["currency", "outcome"]
        )
        .expect("Failed to register CHARGE_AMOUNT_MINOR_TOTAL")
    });

    LAST_RUN_FAILURE_RATIO.get_or_init(|| {
        register_gauge!(
            "billing_last_run_failure_ratio",
            "Share of failed items in the last completed run"
        )
        .expect("Failed to register LAST_RUN_FAILURE_RATIO")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_notifications_total",
                "Notifications by kind and delivery outcome"
            ),
            &["kind", "outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished (or aborted) billing run.
pub fn record_billing_run(status: &str, dry_run: bool) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        let dry_run = if dry_run { "true" } else { "false" };
        counter.with_label_values(&[status, dry_run]).inc();
    }
}

/// Record one charge attempt and its amount.
pub fn record_charge(outcome: &str, currency: &str, amount: i64) {
    if let Some(counter) = CHARGE_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
    if let Some(counter) = CHARGE_AMOUNT_MINOR_TOTAL.get() {
        counter
            .with_label_values(&[currency, outcome])
            .inc_by(amount.unsigned_abs());
    }
}

pub fn set_last_run_failure_ratio(ratio: f64) {
    if let Some(gauge) = LAST_RUN_FAILURE_RATIO.get() {
        gauge.set(ratio);
    }
}

pub fn record_notification(kind: &str, outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[kind, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
