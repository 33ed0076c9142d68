use std::sync::Arc;

use crate::{
    observer::{BearerToken, HttpLogger, JsonContentType},
    retry::attach_retry,
    ClientConfig, HttpClient, Result, RetryPolicy,
};

/// Repeatable builder of configured [`HttpClient`]s.
///
/// Holds a resolved [`ClientConfig`]; every [`ClientFactory::build`] call
/// produces a new client with the same pipeline.
#[derive(Clone, Debug)]
pub struct ClientFactory {
    config: Arc<ClientConfig>,
}

/// Captures `config` and returns the builder for it.
pub fn http_client_factory(config: ClientConfig) -> ClientFactory {
    ClientFactory::new(config)
}

impl ClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds a client.
    ///
    /// Pipeline, in order:
    /// 1. request observers: log, `Authorization` from `get_token` (if set),
    ///    `Content-Type: application/json`
    /// 2. response observer: log response or safe error fields
    /// 3. retry policy (if `with_retry`)
    /// 4. `attach_token_provider` hook (if set), awaited
    ///
    /// No network call is made here.
    pub async fn build(&self) -> Result<HttpClient> {
        let config = &self.config;
        let mut client = HttpClient::new(
            config.base_url.clone(),
            &config.options,
            config.logger.clone(),
        )?;

        let http_logger = Arc::new(HttpLogger::new(config.logger.clone()));
        client.add_request_observer(http_logger.clone());
        if let Some(provider) = &config.get_token {
            client.add_request_observer(Arc::new(BearerToken::new(provider.clone())));
        }
        client.add_request_observer(Arc::new(JsonContentType));
        client.add_response_observer(http_logger);

        if config.with_retry {
            attach_retry(&mut client, RetryPolicy::from(&config.options));
        }

        if let Some(hook) = &config.attach_token_provider {
            hook.attach(&mut client).await?;
        }

        Ok(client)
    }
}
