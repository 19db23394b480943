/// Integration tests for resilience library
use resilience::{
    presets,
    retry::{with_retry, RetryConfig, RetryError},
    timeout::{with_timeout_result, TimeoutError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

#[tokio::test]
async fn test_slow_call_is_retried_until_it_answers_in_time() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = with_retry(&quick_retry(3), move || {
        let attempt = counter_clone.fetch_add(1, Ordering::SeqCst);
        with_timeout_result(Duration::from_millis(20), async move {
            if attempt == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok::<_, String>("stored")
        })
    })
    .await;

    assert_eq!(tokio_test::assert_ok!(result), "stored");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_timeouts_exhaust_the_budget() {
    let result = with_retry(&quick_retry(2), || {
        with_timeout_result(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), String>(())
        })
    })
    .await;

    match result {
        Err(RetryError::Exhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, TimeoutError::Elapsed(_)));
        }
        other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_exponential_backoff_timing() {
    let start = std::time::Instant::now();

    let _ = with_retry(&quick_retry(3), || async { Err::<(), _>("down") }).await;

    // 5ms + 10ms + 20ms
    assert!(start.elapsed() >= Duration::from_millis(35));
}

#[test]
fn test_store_preset_values() {
    let config = presets::store_config();
    assert_eq!(config.timeout.duration, Duration::from_secs(2));
    let retry = config.retry.unwrap();
    assert_eq!(retry.max_retries, 3);
    assert_eq!(retry.initial_backoff, Duration::from_millis(50));
}
