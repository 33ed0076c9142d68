use std::{fmt, sync::Arc, time::Duration};

use reqwest::Method;
use serde::Serialize;
use serde_json::json;

use crate::{
    envelope::status_text,
    logger::{fields, Logger},
    observer::{run_request_observers, run_response_observers, RequestObserver, ResponseObserver},
    ClientOptions, HttpClientError, RequestEnvelope, ResponseEnvelope, Result, RetryPolicy,
    TransportError,
};

#[derive(Clone)]
/// HTTP client with an observer pipeline and an optional retry policy.
///
/// Usually obtained from [`crate::ClientFactory::build`]. Cloning is cheap and
/// clones share the connection pool; every call keeps its own headers, retry
/// counter and backoff timer.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: Option<String>,
    timeout: Duration,
    connect_timeout: Duration,
    logger: Arc<dyn Logger>,
    request_observers: Vec<Arc<dyn RequestObserver>>,
    response_observers: Vec<Arc<dyn ResponseObserver>>,
    retry: Option<RetryPolicy>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_observers", &self.request_observers.len())
            .field("response_observers", &self.response_observers.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpClient {
    /// Creates a bare client: no observers, no retry.
    pub fn new(
        base_url: Option<String>,
        options: &ClientOptions,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let connect_timeout = Duration::from_millis(options.connect_timeout_ms);
        let builder = reqwest::Client::builder();
        // connect_timeout is not available on wasm32 (the browser owns sockets)
        #[cfg(not(target_arch = "wasm32"))]
        let builder = builder.connect_timeout(connect_timeout);
        let http = builder
            .build()
            .map_err(|err| HttpClientError::Build(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            timeout: Duration::from_millis(options.timeout_ms),
            connect_timeout,
            logger,
            request_observers: Vec::new(),
            response_observers: Vec::new(),
            retry: None,
        })
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    /// Appends a request observer; it runs after those already registered.
    pub fn add_request_observer(&mut self, observer: Arc<dyn RequestObserver>) -> &mut Self {
        self.request_observers.push(observer);
        self
    }

    /// Appends a response observer; it runs after those already registered.
    pub fn add_response_observer(&mut self, observer: Arc<dyn ResponseObserver>) -> &mut Self {
        self.response_observers.push(observer);
        self
    }

    pub(crate) fn set_retry_policy(&mut self, policy: Option<RetryPolicy>) {
        self.retry = policy;
    }

    /// Starts a request relative to this client's base URL.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestEnvelope {
        let mut request = RequestEnvelope::new(method, url);
        request.base_url = self.base_url.clone();
        request
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::GET, url)).await
    }

    pub async fn head(&self, url: impl Into<String>) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::HEAD, url)).await
    }

    pub async fn delete(&self, url: impl Into<String>) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::DELETE, url)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: impl Into<String>,
        body: &T,
    ) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::POST, url).json(body)?).await
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        url: impl Into<String>,
        body: &T,
    ) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::PUT, url).json(body)?).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        url: impl Into<String>,
        body: &T,
    ) -> Result<ResponseEnvelope> {
        self.send(self.request(Method::PATCH, url).json(body)?).await
    }

    /// Sends `request` through the observer pipeline, retrying per policy.
    ///
    /// Only the final outcome is returned; earlier failed attempts are
    /// visible through the retry log entries alone.
    pub async fn send(&self, mut request: RequestEnvelope) -> Result<ResponseEnvelope> {
        if request.base_url.is_none() {
            request.base_url = self.base_url.clone();
        }

        let mut retry_count = 0usize;
        loop {
            let error = match self.attempt(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let Some(policy) = &self.retry else {
                return Err(error);
            };
            if retry_count >= policy.max_retries || !policy.should_retry(&request, &error) {
                return Err(error);
            }

            retry_count += 1;
            self.log_retry(&request, retry_count, &error);
            policy.wait_before_retry(retry_count).await;
        }
    }

    async fn attempt(&self, mut request: RequestEnvelope) -> Result<ResponseEnvelope> {
        let outcome = match run_request_observers(&self.request_observers, &mut request).await {
            Ok(()) => self.dispatch(request).await,
            Err(err) => Err(err),
        };
        run_response_observers(&self.response_observers, outcome).await
    }

    async fn dispatch(&self, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        // On WASM, reqwest uses AbortController for the timeout; `.timeout()`
        // is available on both targets.
        let mut builder = self
            .http
            .request(request.method.clone(), request.full_url())
            .headers(request.headers.clone())
            .timeout(request.timeout.unwrap_or(self.timeout));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(TransportError::from_reqwest)?;

        let envelope = ResponseEnvelope {
            config: request,
            status,
            status_text: status_text(status),
            headers,
            body,
        };
        if status.is_success() {
            Ok(envelope)
        } else {
            Err(TransportError::from_response(envelope).into())
        }
    }

    fn log_retry(&self, request: &RequestEnvelope, retry_count: usize, error: &HttpClientError) {
        let transport = error.as_transport();
        self.logger.info(
            "Retrying http call",
            &fields(json!({
                "baseURL": request.base_url,
                "url": request.url,
                "method": request.method.as_str(),
                "retryCount": retry_count,
                "errorCode": transport.and_then(|err| err.code).map(|code| code.as_str()),
                "errorMessage": transport.map_or_else(|| error.to_string(), |err| err.message.clone()),
            })),
        );
    }
}
