/// Timeout wrapper for async operations
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::metrics::TimeoutMetrics;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E = std::convert::Infallible> {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("Operation failed: {0}")]
    Failed(E),
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(value) => {
            TimeoutMetrics::record_operation("completed");
            Ok(value)
        }
        Err(_) => {
            TimeoutMetrics::record_operation("elapsed");
            Err(TimeoutError::Elapsed(duration))
        }
    }
}

/// Execute a fallible future with timeout, keeping the operation's own error type
pub async fn with_timeout_result<F, T, E>(
    duration: Duration,
    future: F,
) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => {
            TimeoutMetrics::record_operation("completed");
            Ok(result)
        }
        Ok(Err(e)) => {
            TimeoutMetrics::record_operation("failed");
            Err(TimeoutError::Failed(e))
        }
        Err(_) => {
            TimeoutMetrics::record_operation("elapsed");
            Err(TimeoutError::Elapsed(duration))
        }
    }
}
