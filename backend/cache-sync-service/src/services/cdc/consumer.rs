use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{Result, SyncServiceError};

/// One message as delivered by the log, before any decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for Kafka tombstones
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: Some(payload),
        }
    }

    pub fn tombstone(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: None,
        }
    }
}

/// Poll/commit view of an ordered change log
///
/// A client is owned by exactly one consume loop. `commit` acknowledges everything returned by
/// previous polls, so callers commit only once every polled message is terminal.
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Up to one batch of messages, waiting at most `timeout` for the first one
    async fn poll_batch(&self, timeout: Duration) -> Result<Vec<RawMessage>>;

    async fn commit(&self) -> Result<()>;
}

/// Kafka consumer settings for one worker
#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    pub group_id: String,
    /// Maximum messages returned by one poll
    pub batch_size: usize,
    pub session_timeout_ms: u32,
}

/// `LogClient` over an rdkafka `StreamConsumer` with manual offset commits
pub struct KafkaLogClient {
    consumer: StreamConsumer,
    batch_size: usize,
}

impl KafkaLogClient {
    pub fn new(config: &KafkaConsumerConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "true")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                SyncServiceError::Kafka(e.to_string())
            })?;

        Ok(Self {
            consumer,
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl LogClient for KafkaLogClient {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(|e| {
            error!("Failed to subscribe to topics: {}", e);
            SyncServiceError::Kafka(e.to_string())
        })?;

        info!(?topics, "Kafka log client subscribed");
        Ok(())
    }

    async fn poll_batch(&self, timeout: Duration) -> Result<Vec<RawMessage>> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => batch.push(RawMessage {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    payload: msg.payload().map(<[u8]>::to_vec),
                }),
                // Surface the error only when nothing was received; otherwise hand over what we
                // have and let the next poll report it
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    debug!(error = %e, "Kafka receive failed mid-batch, returning partial batch");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// Queues the current positions for commit without waiting on the broker round trip.
    /// Failures surface through the client's commit callback and the next commit retries them.
    async fn commit(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(SyncServiceError::from)
    }
}

/// Scripted in-memory log for tests and local runs
///
/// Each queued batch is returned by one poll; an exhausted script polls empty after waiting
/// out the timeout, like an idle topic.
#[derive(Default)]
pub struct MemoryLogClient {
    batches: Mutex<VecDeque<Vec<RawMessage>>>,
    delivered: Mutex<Vec<RawMessage>>,
    committed: Mutex<Vec<i64>>,
    subscriptions: Mutex<Vec<String>>,
    failing_polls: AtomicU32,
}

impl MemoryLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batches(batches: Vec<Vec<RawMessage>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        }
    }

    /// Make the next `n` polls fail with a transient error
    pub fn fail_next_polls(&self, n: u32) {
        self.failing_polls.store(n, Ordering::SeqCst);
    }

    pub async fn remaining_batches(&self) -> usize {
        self.batches.lock().await.len()
    }

    /// Offset of the last delivered message at every commit, in commit order
    pub async fn commits(&self) -> Vec<i64> {
        self.committed.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.subscriptions.lock().await.extend_from_slice(topics);
        Ok(())
    }

    async fn poll_batch(&self, timeout: Duration) -> Result<Vec<RawMessage>> {
        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SyncServiceError::Kafka("broker transport failure".to_string()));
        }

        let next = self.batches.lock().await.pop_front();
        match next {
            Some(batch) => {
                self.delivered.lock().await.extend(batch.iter().cloned());
                Ok(batch)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        let last = self.delivered.lock().await.last().map(|m| m.offset);
        if let Some(offset) = last {
            self.committed.lock().await.push(offset);
        }
        Ok(())
    }
}

/// Consecutive poll/commit failures before a worker reports unhealthy
pub const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Consecutive failures before failures are logged as critical
pub const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// Health of one consume loop, shared with the operator surface
pub struct ConsumerHealth {
    worker: usize,
    consecutive_count: AtomicU32,
    /// Unix millis of the last successful poll or commit
    last_success_ms: AtomicI64,
    min_backoff: Duration,
    max_backoff: Duration,
}

/// Serializable view of a `ConsumerHealth`
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub worker: usize,
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub millis_since_last_success: u64,
    pub current_backoff_ms: u64,
}

impl ConsumerHealth {
    pub fn new(worker: usize) -> Self {
        Self::with_backoff(worker, Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn with_backoff(worker: usize, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            worker,
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Returns the new consecutive error count
    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last).max(0);
        Duration::from_millis(elapsed as u64)
    }

    /// `min * 2^(errors-1)`, capped at the maximum backoff
    pub fn calculate_backoff(&self) -> Duration {
        let errors = self.consecutive_errors();
        if errors == 0 {
            return self.min_backoff;
        }

        let factor = 2u32.saturating_pow(errors.saturating_sub(1).min(31));
        self.min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Unhealthy after too many consecutive errors, or failing with no success for 5 minutes
    pub fn is_healthy(&self) -> bool {
        let errors = self.consecutive_errors();
        if errors >= UNHEALTHY_ERROR_THRESHOLD {
            return false;
        }

        !(errors > 0 && self.time_since_success() > Duration::from_secs(300))
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            worker: self.worker,
            healthy: self.is_healthy(),
            consecutive_errors: self.consecutive_errors(),
            millis_since_last_success: self.time_since_success().as_millis() as u64,
            current_backoff_ms: self.calculate_backoff().as_millis() as u64,
        }
    }
}
