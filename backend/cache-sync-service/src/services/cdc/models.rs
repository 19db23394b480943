use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{DecodeError, SyncError};

/// CDC operation types from Debezium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CdcOperation {
    /// Insert operation (c = create)
    #[serde(rename = "c")]
    Insert,
    /// Update operation (u = update)
    #[serde(rename = "u")]
    Update,
    /// Delete operation (d = delete)
    #[serde(rename = "d")]
    Delete,
    /// Initial snapshot row (r = read); handled exactly like an insert
    #[serde(rename = "r")]
    SnapshotRead,
}

impl CdcOperation {
    /// Insert, Update and SnapshotRead all write the `after` image
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Self::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::SnapshotRead => "snapshot_read",
        }
    }
}

impl fmt::Display for CdcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CDC message structure from Debezium
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload directly
/// without a wrapper object. This enum accepts both formats.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CdcMessage {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema { payload: CdcPayload },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(CdcPayload),
}

impl CdcMessage {
    pub fn into_payload(self) -> CdcPayload {
        match self {
            CdcMessage::WithSchema { payload } => payload,
            CdcMessage::WithoutSchema(payload) => payload,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdcPayload {
    /// Row state before the change (null for Insert/Read)
    #[serde(default)]
    pub before: Option<Value>,

    /// Row state after the change (null for Delete)
    #[serde(default)]
    pub after: Option<Value>,

    /// Source metadata (database, table, timestamp, etc.)
    #[serde(default)]
    pub source: Option<CdcSource>,

    /// Operation type (c/u/d/r)
    pub op: CdcOperation,

    /// Time the connector processed the change, in milliseconds since epoch
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CdcSource {
    /// Connector type (e.g., "postgresql")
    #[serde(default)]
    pub connector: Option<String>,

    /// Logical name of the database server
    #[serde(default)]
    pub name: Option<String>,

    /// Database name
    #[serde(default)]
    pub db: Option<String>,

    /// Schema name (for PostgreSQL)
    #[serde(default)]
    pub schema: Option<String>,

    /// Table name
    #[serde(default)]
    pub table: Option<String>,
}

impl CdcSource {
    /// `schema.table` (or `db.table`) when the connector reports a table
    fn qualified_table(&self) -> Option<String> {
        let table = self.table.as_deref()?;
        match self.schema.as_deref().or(self.db.as_deref()) {
            Some(namespace) => Some(format!("{}.{}", namespace, table)),
            None => Some(table.to_string()),
        }
    }
}

/// Normalized row-level change, independent of the wire envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: CdcOperation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Logical source table, used for routing
    pub source_table: String,
    /// Milliseconds since epoch; observability only
    pub timestamp_ms: Option<i64>,
}

impl ChangeEvent {
    pub fn new(operation: CdcOperation, source_table: impl Into<String>) -> Self {
        Self {
            operation,
            before: None,
            after: None,
            source_table: source_table.into(),
            timestamp_ms: None,
        }
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_timestamp_ms(mut self, ts_ms: i64) -> Self {
        self.timestamp_ms = Some(ts_ms);
        self
    }

    /// Decode one log message. The topic names the source when the envelope does not.
    pub fn from_message(topic: &str, payload: Option<&[u8]>) -> Result<Self, SyncError> {
        let bytes = match payload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                return Err(SyncError::MalformedEvent {
                    table: topic.to_string(),
                    reason: "message has no payload".to_string(),
                })
            }
        };

        let message: CdcMessage =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Decode {
                table: topic.to_string(),
                op: None,
                source: DecodeError::Envelope(e.to_string()),
            })?;
        let payload = message.into_payload();

        let source_table = payload
            .source
            .as_ref()
            .and_then(CdcSource::qualified_table)
            .unwrap_or_else(|| topic.to_string());

        Ok(Self {
            operation: payload.op,
            before: payload.before,
            after: payload.after,
            source_table,
            timestamp_ms: payload.ts_ms,
        })
    }

    /// Reject events that carry no row image at all
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.before.is_none() && self.after.is_none() {
            return Err(SyncError::MalformedEvent {
                table: self.source_table.clone(),
                reason: format!("{} event has neither 'before' nor 'after'", self.operation),
            });
        }
        Ok(())
    }

    /// The image the operation is applied from: `after` for upserts, `before` for deletes
    pub fn image(&self) -> Result<&Value, SyncError> {
        let (image, field) = if self.operation.is_upsert() {
            (self.after.as_ref(), "after")
        } else {
            (self.before.as_ref(), "before")
        };

        image.ok_or_else(|| SyncError::MalformedEvent {
            table: self.source_table.clone(),
            reason: format!("{} event requires '{}'", self.operation, field),
        })
    }
}
