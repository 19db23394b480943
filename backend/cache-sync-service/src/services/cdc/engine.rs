use resilience::{with_retry_if, with_timeout_result, RetryConfig, TimeoutError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::consumer::{
    ConsumerHealth, LogClient, RawMessage, CRITICAL_ERROR_THRESHOLD, UNHEALTHY_ERROR_THRESHOLD,
};
use super::models::{CdcOperation, ChangeEvent};
use super::router::TableRouter;
use crate::error::{DecodeError, ErrorReason, StoreError, SyncError, SyncServiceError};
use crate::metrics::{MetricKind, MetricsRecorder};
use crate::store::{AffinityKey, StoreAdapter};

/// Tuning for the apply path and the consume loop
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Retry policy for store calls; only retryable store errors are retried
    pub retry: RetryConfig,
    /// Bound on a single store call; elapsing counts as a retryable failure
    pub store_timeout: Duration,
    /// Compare child and parent partitions after every child upsert
    pub verify_affinity: bool,
    pub poll_timeout: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        let preset = resilience::store_config();
        Self {
            retry: preset.retry.unwrap_or_default(),
            store_timeout: preset.timeout.duration,
            verify_affinity: true,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Terminal state of one change event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Applied {
        kind: MetricKind,
        collection: &'static str,
        key: i64,
    },
    Rejected(SyncError),
}

impl EventOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EventOutcome::Applied { .. })
    }
}

/// Per-batch tally, returned to callers and logged at debug
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub applied: usize,
    pub rejected: usize,
    pub first_offset: Option<i64>,
    pub last_offset: Option<i64>,
}

/// Totals for one consume loop, returned when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub events: u64,
    pub rejected: u64,
    pub commit_failures: u64,
}

/// Applies change events to the partitioned store
///
/// Events are handled one at a time in the order given. Every event ends either applied or
/// rejected, counts `processed` exactly once and exactly one outcome counter, and a rejected
/// event never stops the caller. Cloning is cheap; clones share the store and metrics.
#[derive(Clone)]
pub struct SyncEngine {
    router: Arc<TableRouter>,
    store: Arc<dyn StoreAdapter>,
    metrics: Arc<MetricsRecorder>,
    config: SyncEngineConfig,
}

impl SyncEngine {
    pub fn new(
        router: TableRouter,
        store: Arc<dyn StoreAdapter>,
        metrics: Arc<MetricsRecorder>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            router: Arc::new(router),
            store,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Process one decoded event
    pub async fn apply_event(&self, event: &ChangeEvent) -> EventOutcome {
        let result = self.try_apply(event).await;
        self.finish(result, None, event.timestamp_ms)
    }

    /// Decode and process one raw log message
    pub async fn handle_message(&self, msg: &RawMessage) -> EventOutcome {
        let decoded = ChangeEvent::from_message(&msg.topic, msg.payload.as_deref());
        let (result, ts_ms) = match decoded {
            Ok(event) => (self.try_apply(&event).await, event.timestamp_ms),
            Err(e) => (Err(e), None),
        };
        self.finish(result, Some(msg), ts_ms)
    }

    /// Process a batch strictly in delivery order
    pub async fn process_batch(&self, batch: &[RawMessage]) -> BatchReport {
        let mut report = BatchReport {
            first_offset: batch.first().map(|m| m.offset),
            last_offset: batch.last().map(|m| m.offset),
            ..Default::default()
        };

        for msg in batch {
            report.events += 1;
            if self.handle_message(msg).await.is_applied() {
                report.applied += 1;
            } else {
                report.rejected += 1;
            }
        }

        debug!(
            events = report.events,
            applied = report.applied,
            rejected = report.rejected,
            first_offset = ?report.first_offset,
            last_offset = ?report.last_offset,
            "Processed batch"
        );
        report
    }

    /// Consume until the stop signal is set (or its sender dropped)
    ///
    /// The signal is checked between batches only: a polled batch is always processed and
    /// committed before the loop exits. Poll and commit failures back off and retry; a failed
    /// commit leaves the batch uncommitted, so it may be redelivered.
    pub async fn run<L>(
        &self,
        log: &L,
        health: &ConsumerHealth,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunSummary
    where
        L: LogClient + ?Sized,
    {
        let worker = health.worker();
        let mut summary = RunSummary::default();

        info!(worker, "Starting sync loop");
        self.metrics.active_workers.inc();

        while !stop_requested(&shutdown) {
            let batch = match log.poll_batch(self.config.poll_timeout).await {
                Ok(batch) => {
                    health.record_success();
                    batch
                }
                Err(e) => {
                    self.consumer_failure(health, "poll", &e);
                    backoff(health.calculate_backoff(), &mut shutdown).await;
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            let report = self.process_batch(&batch).await;
            summary.batches += 1;
            summary.events += report.events as u64;
            summary.rejected += report.rejected as u64;

            match log.commit().await {
                Ok(()) => {
                    health.record_success();
                    self.metrics.batches_committed_total.inc();
                }
                Err(e) => {
                    summary.commit_failures += 1;
                    self.consumer_failure(health, "commit", &e);
                    backoff(health.calculate_backoff(), &mut shutdown).await;
                }
            }
        }

        self.metrics.active_workers.dec();
        info!(
            worker,
            batches = summary.batches,
            events = summary.events,
            rejected = summary.rejected,
            "Sync loop stopped"
        );
        summary
    }

    fn consumer_failure(&self, health: &ConsumerHealth, stage: &str, e: &SyncServiceError) {
        let consecutive = health.record_error();
        self.metrics.consumer_errors_total.inc();
        let backoff = health.calculate_backoff();

        if consecutive >= CRITICAL_ERROR_THRESHOLD {
            error!(
                worker = health.worker(),
                stage,
                consecutive_errors = consecutive,
                backoff_ms = backoff.as_millis() as u64,
                time_since_success_secs = health.time_since_success().as_secs(),
                "CRITICAL: log client failing persistently: {}",
                e
            );
        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(
                worker = health.worker(),
                stage,
                consecutive_errors = consecutive,
                backoff_ms = backoff.as_millis() as u64,
                "Log client unhealthy after repeated errors: {}",
                e
            );
        } else {
            warn!(
                worker = health.worker(),
                stage,
                consecutive_errors = consecutive,
                backoff_ms = backoff.as_millis() as u64,
                "Log client error, retrying after backoff: {}",
                e
            );
        }
    }

    async fn try_apply(&self, event: &ChangeEvent) -> Result<EventOutcome, SyncError> {
        let kind = self
            .router
            .route(&event.source_table)
            .ok_or_else(|| SyncError::Routing {
                table: event.source_table.clone(),
            })?;

        event.validate()?;
        let image = event.image()?;
        let op = event.operation;
        let collection = kind.collection();

        if op.is_upsert() {
            let record = kind
                .decode(image)
                .map_err(|source| decode_error(event, source))?;
            let key = record.key();
            let affinity = record.affinity();

            self.store_call(collection, key, op, || {
                self.store.put(collection, key, affinity, record.clone())
            })
            .await?;

            if let (true, Some(parent)) = (self.config.verify_affinity, affinity) {
                self.verify_affinity(collection, key, parent).await;
            }

            let kind = if op == CdcOperation::Update {
                MetricKind::Updated
            } else {
                MetricKind::Inserted
            };
            Ok(EventOutcome::Applied {
                kind,
                collection,
                key,
            })
        } else {
            let key = kind
                .decode_key(image)
                .map_err(|source| decode_error(event, source))?;

            let existed = self
                .store_call(collection, key, op, || self.store.remove(collection, key))
                .await?;
            if !existed {
                debug!(collection, key, "Delete of absent key");
            }

            Ok(EventOutcome::Applied {
                kind: MetricKind::Deleted,
                collection,
                key,
            })
        }
    }

    /// One store call under the per-call timeout, retried while the failure is retryable
    async fn store_call<T, F, Fut>(
        &self,
        collection: &'static str,
        key: i64,
        op: CdcOperation,
        mut call: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.config.store_timeout;
        let started = Instant::now();

        let result = with_retry_if(&self.config.retry, StoreError::is_retryable, || {
            let attempt = call();
            async move {
                with_timeout_result(timeout, attempt)
                    .await
                    .map_err(|e| match e {
                        TimeoutError::Elapsed(elapsed) => StoreError::Timeout(elapsed),
                        TimeoutError::Failed(e) => e,
                    })
            }
        })
        .await;

        self.metrics.observe_apply(collection, started.elapsed());

        result.map_err(|e| {
            let attempts = e.attempts();
            SyncError::Apply {
                collection,
                key,
                op,
                attempts,
                source: e.into_inner(),
            }
        })
    }

    /// Advisory only: runs after the put succeeded, so a slow store is cut off at the
    /// per-call timeout and never fails the event
    async fn verify_affinity(&self, collection: &'static str, key: i64, parent: AffinityKey) {
        let timeout = self.config.store_timeout;
        let lookups = async {
            let child = self.store.partition_of(collection, key).await;
            let expected = self.store.partition_of(parent.collection, parent.key).await;
            (child, expected)
        };

        let Ok((child_partition, parent_partition)) = tokio::time::timeout(timeout, lookups).await
        else {
            warn!(
                collection,
                key,
                parent = %parent,
                timeout_ms = timeout.as_millis() as u64,
                "Affinity verification timed out"
            );
            return;
        };

        match (child_partition, parent_partition) {
            (Ok(child), Ok(expected)) if child != expected => {
                warn!(
                    collection,
                    key,
                    parent = %parent,
                    child_partition = child,
                    parent_partition = expected,
                    "Colocation violated: child and parent are in different partitions"
                );
            }
            (Ok(_), Ok(_)) => {}
            (Err(e), _) | (_, Err(e)) => {
                debug!(collection, key, error = %e, "Skipped affinity verification");
            }
        }
    }

    fn finish(
        &self,
        result: Result<EventOutcome, SyncError>,
        msg: Option<&RawMessage>,
        ts_ms: Option<i64>,
    ) -> EventOutcome {
        self.metrics.increment(MetricKind::Processed);
        let (topic, partition, offset) = match msg {
            Some(m) => (Some(m.topic.as_str()), Some(m.partition), Some(m.offset)),
            None => (None, None, None),
        };

        match result {
            Ok(outcome) => {
                if let EventOutcome::Applied {
                    kind,
                    collection,
                    key,
                } = &outcome
                {
                    self.metrics.increment(*kind);
                    debug!(
                        collection,
                        key,
                        outcome = kind.as_str(),
                        topic,
                        partition,
                        offset,
                        ts_ms,
                        "Applied change event"
                    );
                }
                outcome
            }
            Err(err) => {
                let reason = err.reason();
                self.metrics.increment_error(reason);
                let op = err.operation().map(|op| op.as_str());

                if reason == ErrorReason::Apply {
                    error!(
                        table = err.table(),
                        op,
                        reason = reason.as_str(),
                        topic,
                        partition,
                        offset,
                        ts_ms,
                        "Rejected change event: {}",
                        err
                    );
                } else {
                    warn!(
                        table = err.table(),
                        op,
                        reason = reason.as_str(),
                        topic,
                        partition,
                        offset,
                        ts_ms,
                        "Rejected change event: {}",
                        err
                    );
                }
                EventOutcome::Rejected(err)
            }
        }
    }
}

fn decode_error(event: &ChangeEvent, source: DecodeError) -> SyncError {
    SyncError::Decode {
        table: event.source_table.clone(),
        op: Some(event.operation),
        source,
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay`, waking early if the stop signal changes
async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityRecord;
    use crate::store::{MemoryStore, MockStoreAdapter};
    use serde_json::json;

    fn fast_config(max_retries: u32) -> SyncEngineConfig {
        SyncEngineConfig {
            retry: RetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: false,
                ..Default::default()
            },
            store_timeout: Duration::from_millis(200),
            verify_affinity: true,
            poll_timeout: Duration::from_millis(5),
        }
    }

    fn engine_with(store: Arc<dyn StoreAdapter>, config: SyncEngineConfig) -> SyncEngine {
        SyncEngine::new(
            TableRouter::new(),
            store,
            Arc::new(MetricsRecorder::new()),
            config,
        )
    }

    fn insert_customer(id: i64) -> ChangeEvent {
        ChangeEvent::new(CdcOperation::Insert, "inventory.customers")
            .with_after(json!({"id": id, "name": "Jo"}))
    }

    #[tokio::test]
    async fn test_update_is_counted_as_updated() {
        let engine = engine_with(Arc::new(MemoryStore::new()), fast_config(0));
        let event = ChangeEvent::new(CdcOperation::Update, "customers")
            .with_before(json!({"id": 1, "name": "Jo"}))
            .with_after(json!({"id": 1, "name": "Joe"}));

        let outcome = engine.apply_event(&event).await;

        assert_eq!(
            outcome,
            EventOutcome::Applied {
                kind: MetricKind::Updated,
                collection: "customers",
                key: 1
            }
        );
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.updated, 1);
    }

    #[tokio::test]
    async fn test_update_missing_required_field_is_decode_error() {
        let engine = engine_with(Arc::new(MemoryStore::new()), fast_config(0));
        let event = ChangeEvent::new(CdcOperation::Update, "orders")
            .with_after(json!({"id": 10, "status": "shipped"}));

        let outcome = engine.apply_event(&event).await;

        match outcome {
            EventOutcome::Rejected(SyncError::Decode { op, source, .. }) => {
                assert_eq!(op, Some(CdcOperation::Update));
                assert_eq!(source, DecodeError::MissingField { field: "customer_id" });
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(engine.metrics().snapshot().errors_by_reason["decode"], 1);
    }

    #[tokio::test]
    async fn test_retryable_store_failure_exhausts_budget() {
        let mut store = MockStoreAdapter::new();
        store
            .expect_put()
            .times(3)
            .returning(|_, _, _, _| Err(StoreError::Unavailable("node down".into())));

        let engine = engine_with(Arc::new(store), fast_config(2));
        let outcome = engine.apply_event(&insert_customer(1)).await;

        match outcome {
            EventOutcome::Rejected(SyncError::Apply {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, StoreError::Unavailable("node down".into()));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.errored, 1);
        assert_eq!(snapshot.errors_by_reason["apply"], 1);
        assert_eq!(snapshot.inserted, 0);
    }

    #[tokio::test]
    async fn test_transient_store_failure_recovers() {
        let mut store = MockStoreAdapter::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Err(StoreError::Unavailable("leader election".into())));
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let engine = engine_with(Arc::new(store), fast_config(3));
        assert!(engine.apply_event(&insert_customer(1)).await.is_applied());
        assert_eq!(engine.metrics().snapshot().inserted, 1);
    }

    #[tokio::test]
    async fn test_permanent_store_failure_is_not_retried() {
        let mut store = MockStoreAdapter::new();
        store
            .expect_remove()
            .times(1)
            .returning(|collection, _| Err(StoreError::UnknownCollection(collection.to_string())));

        let engine = engine_with(Arc::new(store), fast_config(5));
        let event =
            ChangeEvent::new(CdcOperation::Delete, "customers").with_before(json!({"id": 4}));

        match engine.apply_event(&event).await {
            EventOutcome::Rejected(SyncError::Apply { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_passes_record_and_affinity() {
        let mut store = MockStoreAdapter::new();
        store
            .expect_put()
            .withf(|collection, key, affinity, record| {
                collection.to_string() == "orders"
                    && *key == 1001
                    && *affinity == Some(AffinityKey::new("customers", 7))
                    && matches!(record, EntityRecord::Order(order) if order.customer_id == 7)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        store.expect_partition_of().returning(|_, _| Ok(3));

        let engine = engine_with(Arc::new(store), fast_config(0));
        let event = ChangeEvent::new(CdcOperation::SnapshotRead, "orders")
            .with_after(json!({"id": 1001, "customer_id": 7, "status": "new"}));

        assert!(engine.apply_event(&event).await.is_applied());
        assert_eq!(engine.metrics().snapshot().inserted, 1);
    }

    #[tokio::test]
    async fn test_tombstone_message_is_malformed() {
        let engine = engine_with(Arc::new(MemoryStore::new()), fast_config(0));
        let outcome = engine
            .handle_message(&RawMessage::tombstone("dbserver1.inventory.customers", 0, 7))
            .await;

        assert!(matches!(
            outcome,
            EventOutcome::Rejected(SyncError::MalformedEvent { .. })
        ));
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.errors_by_reason["malformed"], 1);
    }

    #[tokio::test]
    async fn test_batch_report_counts_in_order() {
        let engine = engine_with(Arc::new(MemoryStore::new()), fast_config(0));
        let batch = vec![
            RawMessage::new(
                "dbserver1.inventory.customers",
                0,
                10,
                br#"{"after": {"id": 1}, "op": "c"}"#.to_vec(),
            ),
            RawMessage::new("dbserver1.inventory.customers", 0, 11, b"not json".to_vec()),
            RawMessage::new(
                "dbserver1.inventory.customers",
                0,
                12,
                br#"{"before": {"id": 1}, "op": "d"}"#.to_vec(),
            ),
        ];

        let report = engine.process_batch(&batch).await;

        assert_eq!(
            report,
            BatchReport {
                events: 3,
                applied: 2,
                rejected: 1,
                first_offset: Some(10),
                last_offset: Some(12),
            }
        );
        assert_eq!(engine.store().size("customers").await.unwrap(), 0);
    }
}
