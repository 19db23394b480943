use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::services::cdc::CdcOperation;

pub type Result<T> = std::result::Result<T, SyncServiceError>;

/// Process-level failures: the only errors that stop a worker or the service
#[derive(Debug, Error)]
pub enum SyncServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rdkafka::error::KafkaError> for SyncServiceError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        SyncServiceError::Kafka(err.to_string())
    }
}

impl From<envy::Error> for SyncServiceError {
    fn from(err: envy::Error) -> Self {
        SyncServiceError::Config(err.to_string())
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ResponseError for SyncServiceError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let message = match self {
            SyncServiceError::NotFound(msg) | SyncServiceError::Validation(msg) => msg.clone(),
            _ => self.to_string(),
        };

        HttpResponse::build(code).json(ErrorResponse {
            error: message,
            code: code.as_u16(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            SyncServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A row image (or the envelope carrying it) could not be turned into a typed record
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("required field '{field}' is missing or null")]
    MissingField { field: &'static str },

    #[error("field '{field}' expected {expected}, found {found}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("row image must be an object, found {0}")]
    NotAnObject(&'static str),

    #[error("invalid change event envelope: {0}")]
    Envelope(String),
}

/// Failures reported by a partitioned store adapter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
}

impl StoreError {
    /// Whether repeating the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Why an event ended in the rejected state; also the `reason` metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Routing,
    Decode,
    Malformed,
    Apply,
}

impl ErrorReason {
    pub const ALL: [ErrorReason; 4] = [
        ErrorReason::Routing,
        ErrorReason::Decode,
        ErrorReason::Malformed,
        ErrorReason::Apply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Routing => "routing",
            ErrorReason::Decode => "decode",
            ErrorReason::Malformed => "malformed",
            ErrorReason::Apply => "apply",
        }
    }
}

/// Terminal failure of a single change event. Never stops the consume loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("no entity is routed for table '{table}'")]
    Routing { table: String },

    #[error("failed to decode {} on '{table}': {source}", op_label(.op))]
    Decode {
        table: String,
        op: Option<CdcOperation>,
        #[source]
        source: DecodeError,
    },

    #[error("malformed change event on '{table}': {reason}")]
    MalformedEvent { table: String, reason: String },

    #[error("failed to apply {op} to {collection}/{key} after {attempts} attempts: {source}")]
    Apply {
        collection: &'static str,
        key: i64,
        op: CdcOperation,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

fn op_label(op: &Option<CdcOperation>) -> &'static str {
    op.map_or("event", |op| op.as_str())
}

impl SyncError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            SyncError::Routing { .. } => ErrorReason::Routing,
            SyncError::Decode { .. } => ErrorReason::Decode,
            SyncError::MalformedEvent { .. } => ErrorReason::Malformed,
            SyncError::Apply { .. } => ErrorReason::Apply,
        }
    }

    /// Source table, or the target collection for store failures
    pub fn table(&self) -> &str {
        match self {
            SyncError::Routing { table }
            | SyncError::Decode { table, .. }
            | SyncError::MalformedEvent { table, .. } => table,
            SyncError::Apply { collection, .. } => collection,
        }
    }

    pub fn operation(&self) -> Option<CdcOperation> {
        match self {
            SyncError::Decode { op, .. } => *op,
            SyncError::Apply { op, .. } => Some(*op),
            SyncError::Routing { .. } | SyncError::MalformedEvent { .. } => None,
        }
    }
}
