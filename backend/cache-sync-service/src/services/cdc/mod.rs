//! Change data capture ingestion
//!
//! Debezium change events are polled from the log, routed by source table to an entity kind,
//! decoded into typed records and applied to the partitioned store as idempotent upserts and
//! deletes. Offsets are committed once per batch, after every event in it is terminal, which
//! gives at-least-once delivery into the store.

mod consumer;
mod engine;
mod models;
mod router;

pub use consumer::{
    ConsumerHealth, ConsumerStatus, KafkaConsumerConfig, KafkaLogClient, LogClient,
    MemoryLogClient, RawMessage, CRITICAL_ERROR_THRESHOLD, UNHEALTHY_ERROR_THRESHOLD,
};
pub use engine::{BatchReport, EventOutcome, RunSummary, SyncEngine, SyncEngineConfig};
pub use models::{CdcMessage, CdcOperation, CdcPayload, CdcSource, ChangeEvent};
pub use router::TableRouter;
