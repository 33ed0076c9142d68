use std::time::Duration;

use reqwest::{Method, StatusCode};

// tokio::time::sleep is only available on non-WASM targets.
#[cfg(not(target_arch = "wasm32"))]
use tokio::time::sleep;

use crate::{ClientOptions, ErrorCode, HttpClient, HttpClientError, RequestEnvelope, TransportError};

/// Largest retry budget accepted from [`ClientOptions`].
pub const MAX_RETRIES: usize = 32;

/// Bounded retry with exponential backoff.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Backoff unit; retry `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl From<&ClientOptions> for RetryPolicy {
    fn from(options: &ClientOptions) -> Self {
        Self {
            max_retries: options.max_retries.min(MAX_RETRIES),
            base_delay: Duration::from_millis(options.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based).
    ///
    /// Never zero; a zero base delay is treated as one millisecond.
    ///
    /// Strictly increasing up to [`MAX_RETRIES`] as long as
    /// `base_delay * 2^retry_count` fits in `u64` milliseconds. Past that
    /// point the delay stays at its ceiling instead of overflowing.
    pub fn delay(&self, retry_count: usize) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let exp = retry_count.min(MAX_RETRIES) as u32;
        Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
    }

    /// Whether the failed `request` should be issued again.
    ///
    /// Observer, decode and construction failures are never retried.
    pub fn should_retry(&self, request: &RequestEnvelope, error: &HttpClientError) -> bool {
        let Some(error) = error.as_transport() else {
            return false;
        };
        is_network_error(error)
            || is_idempotent_request_error(&request.method, error)
            || matches!(
                error.code,
                Some(ErrorCode::ConnectionAborted | ErrorCode::TimedOut)
            )
    }

    /// Sleeps for [`RetryPolicy::delay`] before the given retry.
    ///
    /// Returns immediately on WASM targets, where no tokio timer exists.
    pub(crate) async fn wait_before_retry(&self, retry_count: usize) {
        let delay = self.delay(retry_count);

        #[cfg(not(target_arch = "wasm32"))]
        sleep(delay).await;

        #[cfg(target_arch = "wasm32")]
        let _ = delay;
    }
}

/// The call never got a response for a reason other than its own timeout.
pub fn is_network_error(error: &TransportError) -> bool {
    !error.has_response()
        && error
            .code
            .is_some_and(|code| code != ErrorCode::ConnectionAborted && code.is_retry_allowed())
}

/// A retryable failure of a method that is safe to repeat.
pub fn is_idempotent_request_error(method: &Method, error: &TransportError) -> bool {
    is_idempotent_method(method) && is_retryable_error(error)
}

pub fn is_idempotent_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// No response at all, 429, or a 5xx, and not aborted by our own timeout.
fn is_retryable_error(error: &TransportError) -> bool {
    if error.code == Some(ErrorCode::ConnectionAborted) {
        return false;
    }
    match error.status {
        None => {
            !error.has_response() && error.code.map_or(true, ErrorCode::is_retry_allowed)
        }
        Some(status) => {
            status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..=599).contains(&status)
        }
    }
}

/// Installs `policy` on `client` and hands the same client back.
pub fn attach_retry(client: &mut HttpClient, policy: RetryPolicy) -> &mut HttpClient {
    client.set_retry_policy(Some(policy));
    client
}
