/// Prometheus metrics for retry and timeout wrappers
#[cfg(feature = "metrics")]
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;

#[cfg(feature = "metrics")]
static TIMEOUT_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "resilience_timeout_operations_total",
        "Total number of operations run under a timeout, by outcome",
        &["result"]
    )
    .expect("Failed to register timeout operations metric")
});

#[cfg(feature = "metrics")]
static RETRY_ATTEMPTS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "resilience_retry_attempts",
        "Number of attempts before success, permanent failure or exhaustion",
        &["result"],
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0]
    )
    .expect("Failed to register retry attempts metric")
});

/// Metrics collector for timeouts
pub struct TimeoutMetrics;

/// Metrics collector for retries
pub struct RetryMetrics;

#[cfg(feature = "metrics")]
impl TimeoutMetrics {
    pub fn record_operation(result: &str) {
        TIMEOUT_OPERATIONS.with_label_values(&[result]).inc();
    }
}

#[cfg(feature = "metrics")]
impl RetryMetrics {
    pub fn record_attempts(result: &str, attempts: u32) {
        RETRY_ATTEMPTS
            .with_label_values(&[result])
            .observe(attempts as f64);
    }
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
impl TimeoutMetrics {
    pub fn record_operation(_result: &str) {}
}

#[cfg(not(feature = "metrics"))]
impl RetryMetrics {
    pub fn record_attempts(_result: &str, _attempts: u32) {}
}
