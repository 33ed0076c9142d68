//! `resilient-http` builds outbound HTTP clients that are safe to log and
//! quick to recover.
//!
//! A [`ClientFactory`] turns a [`ClientConfig`] into an [`HttpClient`] whose
//! every call:
//! - logs request and response metadata, and only the safe fields of errors
//! - carries an `Authorization` header from a [`TokenProvider`], if configured
//! - is sent with `Content-Type: application/json`
//! - is retried with exponential backoff on transient failures, unless
//!   disabled
//!
//! An [`AttachTokenProvider`] hook (such as `OidcSession`) can customize the
//! client further before it is handed out.

mod client;
mod config;
mod envelope;
mod error;
mod factory;
mod options;
mod token;

pub mod logger;
pub mod observer;
pub mod retry;
#[cfg(not(target_arch = "wasm32"))]
pub mod session;

pub use client::HttpClient;
pub use config::ClientConfig;
pub use envelope::{resolve_url, RequestEnvelope, ResponseEnvelope};
pub use error::{ErrorCode, HttpClientError, TransportError};
pub use factory::{http_client_factory, ClientFactory};
pub use logger::{Fields, Logger};
pub use observer::{BearerToken, HttpLogger, JsonContentType, RequestObserver, ResponseObserver};
pub use options::ClientOptions;
pub use retry::{attach_retry, RetryPolicy};
#[cfg(not(target_arch = "wasm32"))]
pub use session::{ClientCredentials, OidcSession};
pub use token::{AttachTokenProvider, BoxError, StaticToken, TokenProvider};

/// Re-exported so callers can build requests without a direct dependency.
pub use reqwest::{header, Method, StatusCode};

pub type Result<T> = std::result::Result<T, HttpClientError>;
