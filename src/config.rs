use std::{fmt, sync::Arc};

use crate::{
    logger::{default_logger, Logger},
    AttachTokenProvider, ClientOptions, TokenProvider,
};

/// Everything the factory needs to build a client.
///
/// `get_token` and `attach_token_provider` are independent: either, both or
/// neither may be set, and both are applied when present.
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub with_retry: bool,
    pub get_token: Option<Arc<dyn TokenProvider>>,
    pub attach_token_provider: Option<Arc<dyn AttachTokenProvider>>,
    pub logger: Arc<dyn Logger>,
    pub options: ClientOptions,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("with_retry", &self.with_retry)
            .field("get_token", &self.get_token.as_ref().map(|_| "<provider>"))
            .field(
                "attach_token_provider",
                &self.attach_token_provider.as_ref().map(|_| "<hook>"),
            )
            .field("options", &self.options)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            with_retry: true,
            get_token: None,
            attach_token_provider: None,
            logger: default_logger(),
            options: ClientOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Enables or disables the retry policy. Enabled by default.
    pub fn with_retry(mut self, with_retry: bool) -> Self {
        self.with_retry = with_retry;
        self
    }

    /// Sets the provider whose result becomes the `Authorization` header.
    pub fn get_token<P>(mut self, provider: P) -> Self
    where
        P: TokenProvider + 'static,
    {
        self.get_token = Some(Arc::new(provider));
        self
    }

    pub fn attach_token_provider<A>(mut self, hook: A) -> Self
    where
        A: AttachTokenProvider + 'static,
    {
        self.attach_token_provider = Some(Arc::new(hook));
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Creates a config from environment variables.
    ///
    /// Reads:
    /// - `HTTP_CLIENT_BASE_URL` — optional base URL
    /// - `HTTP_CLIENT_WITH_RETRY` — `true`/`false`, defaults to `true`
    /// - `HTTP_CLIENT_TIMEOUT_MS` — optional per-attempt timeout
    /// - `HTTP_CLIENT_TOKEN` — optional static `Authorization` value
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    ///
    /// **Not available on `wasm32` targets** — environment variables do not
    /// exist in browser runtimes.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(base_url) = lookup("HTTP_CLIENT_BASE_URL").filter(|v| !v.trim().is_empty()) {
            config.base_url = Some(base_url.trim().to_owned());
        }
        if let Some(raw) = lookup("HTTP_CLIENT_WITH_RETRY") {
            config.with_retry = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => return Err(format!("HTTP_CLIENT_WITH_RETRY has invalid value '{other}'")),
            };
        }
        if let Some(raw) = lookup("HTTP_CLIENT_TIMEOUT_MS") {
            config.options.timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| format!("HTTP_CLIENT_TIMEOUT_MS is not a number: '{raw}'"))?;
        }
        if let Some(token) = lookup("HTTP_CLIENT_TOKEN").filter(|v| !v.trim().is_empty()) {
            config = config.get_token(crate::StaticToken::new(token.trim()));
        }

        Ok(config)
    }
}
