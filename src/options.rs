/// Timeouts and retry budget of a built client.
///
/// `timeout_ms` and `connect_timeout_ms` go to [`crate::HttpClient::new`];
/// `max_retries` and `retry_backoff_ms` become the client's
/// [`crate::RetryPolicy`] through its `From<&ClientOptions>` impl, and only
/// matter when the client is built with retry enabled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Timeout of a single attempt in milliseconds. Expiry surfaces as
    /// `ECONNABORTED`.
    pub timeout_ms: u64,
    /// Timeout for establishing a connection in milliseconds. Expiry
    /// surfaces as `ETIMEDOUT`; keep it below `timeout_ms` or the attempt
    /// timeout fires first. Ignored on WASM.
    pub connect_timeout_ms: u64,
    /// Maximum number of retries after the initial attempt, capped at
    /// [`crate::retry::MAX_RETRIES`].
    pub max_retries: usize,
    /// Retry `n` waits `retry_backoff_ms * 2^n`.
    pub retry_backoff_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}
