//! Metrics module for metering-service.
//! Provides Prometheus metrics for ingestion, invoicing and per-tenant metering.

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
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Events inserted (per-tenant metering)
pub static EVENTS_INGESTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Events dropped as duplicates
pub static EVENTS_DEDUPLICATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices generated by final status
pub static INVOICES_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Tax provider attempts by outcome
pub static TAX_PROVIDER_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing sweep runs by status
pub static SWEEP_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup; repeated calls are no-ops.
pub fn init_metrics() {
    EVENTS_INGESTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_events_ingested_total",
                "Total events inserted by organization"
            ),
            &["organization_id"]
        )
        .expect("Failed to register EVENTS_INGESTED_TOTAL")
    });

    EVENTS_DEDUPLICATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_events_deduplicated_total",
                "Total duplicate events dropped by organization"
            ),
            &["organization_id"]
        )
        .expect("Failed to register EVENTS_DEDUPLICATED_TOTAL")
    });

    INVOICES_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_invoices_generated_total",
                "Total invoices generated by organization and status"
            ),
            &["organization_id", "status"]
        )
        .expect("Failed to register INVOICES_GENERATED_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "metering_invoice_amount_total",
                "Total invoiced amount by organization and currency"
            ),
            &["organization_id", "currency"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    TAX_PROVIDER_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_tax_provider_attempts_total",
                "Tax provider attempts by provider and outcome"
            ),
            &["provider", "outcome"]
        )
        .expect("Failed to register TAX_PROVIDER_ATTEMPTS_TOTAL")
    });

    SWEEP_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_sweep_runs_total", "Billing sweep runs by status"),
            &["status"]
        )
        .expect("Failed to register SWEEP_RUNS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
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

pub fn record_events_ingested(organization_id: &str, count: u64) {
    if let Some(counter) = EVENTS_INGESTED_TOTAL.get() {
        counter.with_label_values(&[organization_id]).inc_by(count);
    }
}

pub fn record_events_deduplicated(organization_id: &str, count: u64) {
    if let Some(counter) = EVENTS_DEDUPLICATED_TOTAL.get() {
        counter.with_label_values(&[organization_id]).inc_by(count);
    }
}

pub fn record_invoice_generated(organization_id: &str, status: &str) {
    if let Some(counter) = INVOICES_GENERATED_TOTAL.get() {
        counter.with_label_values(&[organization_id, status]).inc();
    }
}

/// Record an invoiced amount for financial tracking.
pub fn record_invoice_amount(organization_id: &str, currency: &str, amount: f64) {
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[organization_id, currency])
            .inc_by(amount.abs());
    }
}

pub fn record_tax_attempt(provider: &str, outcome: &str) {
    if let Some(counter) = TAX_PROVIDER_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn record_sweep_run(status: &str) {
    if let Some(counter) = SWEEP_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
