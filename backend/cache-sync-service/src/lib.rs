//! Cache sync service
//!
//! Consumes Debezium change events from Kafka and keeps a partitioned in-process store in
//! step with the source tables, colocating child rows with their parents.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use error::{DecodeError, ErrorReason, Result, StoreError, SyncError, SyncServiceError};
pub use metrics::{MetricKind, MetricsRecorder, MetricsSnapshot};
pub use store::{AffinityKey, MemoryStore, StoreAdapter};
