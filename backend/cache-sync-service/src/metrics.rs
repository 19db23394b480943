/// Sync engine metrics
///
/// Counters live in a registry owned by the recorder rather than the process-wide default one,
/// so several engines (one per log partition, or one per test) can each keep their own counts.
/// Prometheus counters are atomic, which makes increments from many workers and snapshots taken
/// from the HTTP handlers safe without extra locking.
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ErrorReason, Result, SyncServiceError};

/// Counter kinds every processed event can touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Processed,
    Inserted,
    Updated,
    Deleted,
    Errored,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Processed => "processed",
            MetricKind::Inserted => "inserted",
            MetricKind::Updated => "updated",
            MetricKind::Deleted => "deleted",
            MetricKind::Errored => "errored",
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errored: u64,
    pub errors_by_reason: BTreeMap<&'static str, u64>,
}

#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,
    processed: IntCounter,
    inserted: IntCounter,
    updated: IntCounter,
    deleted: IntCounter,
    errored: IntCounter,
    errors: IntCounterVec,
    apply_duration: HistogramVec,
    /// Total number of log-client poll/commit failures
    pub consumer_errors_total: IntCounter,
    /// Total number of batches whose offsets were committed
    pub batches_committed_total: IntCounter,
    /// Workers currently running a consume loop
    pub active_workers: IntGauge,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new(
                "cdc_sync_events_total",
                "Change events by terminal outcome (processed counts every event)",
            ),
            &["kind"],
        )
        .expect("valid metric for cdc_sync_events_total");

        let errors = IntCounterVec::new(
            Opts::new(
                "cdc_sync_errors_total",
                "Rejected change events by failure reason",
            ),
            &["reason"],
        )
        .expect("valid metric for cdc_sync_errors_total");

        let apply_duration = HistogramVec::new(
            HistogramOpts::new(
                "cdc_sync_apply_duration_seconds",
                "Time spent applying one event to the store, retries included",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["collection"],
        )
        .expect("valid metric for cdc_sync_apply_duration_seconds");

        let consumer_errors_total = IntCounter::new(
            "cdc_sync_consumer_errors_total",
            "Total number of log client poll or commit failures",
        )
        .expect("valid metric for cdc_sync_consumer_errors_total");

        let batches_committed_total = IntCounter::new(
            "cdc_sync_batches_committed_total",
            "Total number of batches whose offsets were committed",
        )
        .expect("valid metric for cdc_sync_batches_committed_total");

        let active_workers = IntGauge::new(
            "cdc_sync_active_workers",
            "Number of consume loops currently running",
        )
        .expect("valid metric for cdc_sync_active_workers");

        for metric in [
            Box::new(events.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(errors.clone()),
            Box::new(apply_duration.clone()),
            Box::new(consumer_errors_total.clone()),
            Box::new(batches_committed_total.clone()),
            Box::new(active_workers.clone()),
        ] {
            // A fresh registry only rejects duplicates, and every name above is unique
            let _ = registry.register(metric);
        }

        // Touch every label so all series are exported from the start
        for reason in ErrorReason::ALL {
            errors.with_label_values(&[reason.as_str()]);
        }

        Self {
            processed: events.with_label_values(&[MetricKind::Processed.as_str()]),
            inserted: events.with_label_values(&[MetricKind::Inserted.as_str()]),
            updated: events.with_label_values(&[MetricKind::Updated.as_str()]),
            deleted: events.with_label_values(&[MetricKind::Deleted.as_str()]),
            errored: events.with_label_values(&[MetricKind::Errored.as_str()]),
            registry,
            errors,
            apply_duration,
            consumer_errors_total,
            batches_committed_total,
            active_workers,
        }
    }

    fn counter(&self, kind: MetricKind) -> &IntCounter {
        match kind {
            MetricKind::Processed => &self.processed,
            MetricKind::Inserted => &self.inserted,
            MetricKind::Updated => &self.updated,
            MetricKind::Deleted => &self.deleted,
            MetricKind::Errored => &self.errored,
        }
    }

    pub fn increment(&self, kind: MetricKind) {
        self.counter(kind).inc();
    }

    /// Count one rejected event under `errored` and its reason
    pub fn increment_error(&self, reason: ErrorReason) {
        self.errored.inc();
        self.errors.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn observe_apply(&self, collection: &str, elapsed: Duration) {
        self.apply_duration
            .with_label_values(&[collection])
            .observe(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors_by_reason = ErrorReason::ALL
            .into_iter()
            .map(|reason| {
                let count = self.errors.with_label_values(&[reason.as_str()]).get();
                (reason.as_str(), count)
            })
            .collect();

        MetricsSnapshot {
            processed: self.processed.get(),
            inserted: self.inserted.get(),
            updated: self.updated.get(),
            deleted: self.deleted.get(),
            errored: self.errored.get(),
            errors_by_reason,
        }
    }

    /// Text exposition of this recorder's registry followed by the process-wide default one
    pub fn render(&self) -> Result<String> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| SyncServiceError::Internal(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| SyncServiceError::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_starts_at_zero() {
        let metrics = MetricsRecorder::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.errors_by_reason.len(), ErrorReason::ALL.len());
        assert!(snapshot.errors_by_reason.values().all(|v| *v == 0));
    }

    #[test]
    fn test_increment_error_counts_reason_and_total() {
        let metrics = MetricsRecorder::new();
        metrics.increment(MetricKind::Processed);
        metrics.increment_error(ErrorReason::Decode);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.errored, 1);
        assert_eq!(snapshot.errors_by_reason["decode"], 1);
        assert_eq!(snapshot.errors_by_reason["routing"], 0);
    }

    #[test]
    fn test_recorders_are_independent() {
        let a = MetricsRecorder::new();
        let b = MetricsRecorder::new();
        a.increment(MetricKind::Inserted);
        assert_eq!(a.snapshot().inserted, 1);
        assert_eq!(b.snapshot().inserted, 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.increment(MetricKind::Processed);
                        metrics.increment(MetricKind::Updated);
                        let _ = metrics.snapshot();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 8_000);
        assert_eq!(snapshot.updated, 8_000);
    }

    #[test]
    fn test_render_contains_series() {
        let metrics = MetricsRecorder::new();
        metrics.increment(MetricKind::Deleted);
        let text = metrics.render().unwrap();
        assert!(text.contains("cdc_sync_events_total{kind=\"deleted\"} 1"));
        assert!(text.contains("cdc_sync_errors_total{reason=\"apply\"} 0"));
    }
}
