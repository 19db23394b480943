/// Resilience primitives shared by the sync workers
///
/// - **Retry**: bounded exponential backoff with jitter; the last error is kept on exhaustion
/// - **Timeout**: time limits around a single external call
/// - **Presets**: tuned settings for store writes
///
/// # Example: store write with timeout and bounded retry
///
/// ```rust,no_run
/// use resilience::{presets, with_retry, with_timeout_result};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::store_config();
///     let retry = config.retry.clone().unwrap_or_default();
///
///     let result = with_retry(&retry, || {
///         with_timeout_result(config.timeout.duration, async {
///             // Your store call here
///             Ok::<_, String>(())
///         })
///     })
///     .await;
/// }
/// ```

pub mod metrics;
pub mod presets;
pub mod retry;
pub mod timeout;

pub use presets::{store_config, ServiceConfig};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
