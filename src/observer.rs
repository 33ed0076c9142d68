//! Request and response observers.
//!
//! A client keeps two ordered lists: request observers run before every
//! attempt and may rewrite the per-attempt [`RequestEnvelope`]; response
//! observers run after it and see either the response or the error. Both run
//! in registration order. An observer can turn a response into a failure but
//! never a failure into a response.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};
use serde_json::json;

use crate::{
    logger::{fields, Logger},
    HttpClientError, RequestEnvelope, ResponseEnvelope, Result, TokenProvider,
};

#[async_trait]
pub trait RequestObserver: Send + Sync {
    /// Inspects or rewrites the outgoing request. An error aborts the call.
    async fn on_request(&self, request: &mut RequestEnvelope) -> Result<()>;
}

#[async_trait]
pub trait ResponseObserver: Send + Sync {
    async fn on_response(&self, response: ResponseEnvelope) -> Result<ResponseEnvelope> {
        Ok(response)
    }

    /// Sees a failure on its way to the caller. Must hand an error back.
    async fn on_error(&self, error: HttpClientError) -> HttpClientError {
        error
    }
}

/// Runs `observers` in order against `request`, stopping at the first error.
pub(crate) async fn run_request_observers(
    observers: &[Arc<dyn RequestObserver>],
    request: &mut RequestEnvelope,
) -> Result<()> {
    for observer in observers {
        observer.on_request(request).await?;
    }
    Ok(())
}

/// Threads an attempt's outcome through `observers` in order.
pub(crate) async fn run_response_observers(
    observers: &[Arc<dyn ResponseObserver>],
    mut outcome: Result<ResponseEnvelope>,
) -> Result<ResponseEnvelope> {
    for observer in observers {
        outcome = match outcome {
            Ok(response) => observer.on_response(response).await,
            Err(error) => Err(observer.on_error(error).await),
        };
    }
    outcome
}

/// Logs request metadata, responses, and the safe subset of transport errors.
#[derive(Clone)]
pub struct HttpLogger {
    logger: Arc<dyn Logger>,
}

impl HttpLogger {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl RequestObserver for HttpLogger {
    async fn on_request(&self, request: &mut RequestEnvelope) -> Result<()> {
        self.logger.debug(
            "Making http call",
            &fields(json!({
                "baseURL": request.base_url,
                "url": request.url,
                "method": request.method.as_str(),
            })),
        );
        Ok(())
    }
}

#[async_trait]
impl ResponseObserver for HttpLogger {
    async fn on_response(&self, response: ResponseEnvelope) -> Result<ResponseEnvelope> {
        // url and method are repeated so parallel calls can be told apart
        self.logger.debug(
            "Response of http call",
            &fields(json!({
                "baseURL": response.config.base_url,
                "url": response.config.url,
                "method": response.config.method.as_str(),
                "status": response.status.as_u16(),
                "statusText": response.status_text,
            })),
        );
        Ok(response)
    }

    async fn on_error(&self, error: HttpClientError) -> HttpClientError {
        if let HttpClientError::Transport(transport) = &error {
            self.logger.error("http call error", &transport.safe_fields());
        }
        error
    }
}

/// Sets `Authorization` to a freshly fetched token on every attempt.
#[derive(Clone)]
pub struct BearerToken {
    provider: Arc<dyn TokenProvider>,
}

impl BearerToken {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RequestObserver for BearerToken {
    async fn on_request(&self, request: &mut RequestEnvelope) -> Result<()> {
        let token = self
            .provider
            .token()
            .await
            .map_err(|err| HttpClientError::Observer(format!("token provider failed: {err}")))?;
        let value = HeaderValue::from_str(&token).map_err(|_| {
            HttpClientError::Observer("token is not a valid header value".to_owned())
        })?;
        request.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

/// Forces `Content-Type: application/json`, overwriting any caller value.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonContentType;

#[async_trait]
impl RequestObserver for JsonContentType {
    async fn on_request(&self, request: &mut RequestEnvelope) -> Result<()> {
        request.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(())
    }
}
