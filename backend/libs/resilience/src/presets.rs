/// Preset configurations for the external calls a sync worker makes
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for one kind of external call
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub retry: Option<RetryConfig>,
}

/// Partitioned store writes (put/remove)
///
/// - Timeout: 2s per call
/// - Retry: 3 retries, 50ms doubling up to 1s
///
/// Every retry blocks the partition the event came from, so the budget stays small.
pub fn store_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(2),
        },
        retry: Some(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_is_bounded() {
        let config = store_config();
        let retry = config.retry.expect("store writes retry");
        assert_eq!(retry.max_attempts(), 4);
        assert!(retry.max_backoff <= Duration::from_secs(1));
        assert_eq!(config.timeout.duration, Duration::from_secs(2));
    }
}
