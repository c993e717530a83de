//! Services module for billing-engine.

pub mod metrics;

pub use metrics::{
    get_metrics, init_metrics, record_billing_run, record_charge, record_error,
    record_notification, set_last_run_failure_ratio,
};
