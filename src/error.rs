use std::fmt;

use reqwest::StatusCode;
use serde_json::json;

use crate::{
    logger::{fields, Fields},
    ResponseEnvelope,
};

/// Error type returned by this crate.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HttpClientError {
    /// Network, timeout or non-success status failure of an outgoing call.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A request or response observer failed before the call completed.
    ///
    /// Never retried.
    #[error("observer error: {0}")]
    Observer(String),
    /// Response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),
    /// The underlying HTTP client or an attachment hook could not be set up.
    #[error("client construction error: {0}")]
    Build(String),
}

impl HttpClientError {
    /// Returns the transport error when this is a transport-level failure.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Machine-readable classification of a transport failure.
///
/// The string forms match the codes commonly used by JavaScript HTTP
/// clients so log pipelines can correlate both worlds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connection could not be established or was interrupted.
    Network,
    /// The request exceeded its timeout and was aborted by the client.
    ConnectionAborted,
    /// The connection attempt or socket timed out.
    TimedOut,
    /// Server answered with a 4xx status.
    BadRequest,
    /// Server answered with a 5xx status.
    BadResponse,
    /// The request URL could not be built.
    InvalidUrl,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "ERR_NETWORK",
            Self::ConnectionAborted => "ECONNABORTED",
            Self::TimedOut => "ETIMEDOUT",
            Self::BadRequest => "ERR_BAD_REQUEST",
            Self::BadResponse => "ERR_BAD_RESPONSE",
            Self::InvalidUrl => "ERR_INVALID_URL",
        }
    }

    /// Whether repeating the request could plausibly succeed.
    ///
    /// A malformed URL fails the same way every time.
    pub fn is_retry_allowed(self) -> bool {
        !matches!(self, Self::InvalidUrl)
    }

    /// Code used for a non-success status, if the status has one.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        if status.is_client_error() {
            Some(Self::BadRequest)
        } else if status.is_server_error() {
            Some(Self::BadResponse)
        } else {
            None
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed outgoing call.
///
/// Only [`TransportError::safe_fields`] is ever logged; the attached
/// response (with its body) is kept for the caller to inspect.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: Option<ErrorCode>,
    pub message: String,
    pub status: Option<u16>,
    pub cause: Option<String>,
    pub response: Option<Box<ResponseEnvelope>>,
}

impl TransportError {
    pub fn new(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            cause: None,
            response: None,
        }
    }

    /// Classifies a `reqwest` failure.
    ///
    /// The URL is stripped from the message since it may carry credentials
    /// in its query string.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let code = classify_reqwest(&err);
        let status = err.status().map(|status| status.as_u16());
        let cause = std::error::Error::source(&err).map(ToString::to_string);
        let message = err.without_url().to_string();
        Self {
            code: Some(code),
            message,
            status,
            cause,
            response: None,
        }
    }

    /// Builds the error for a response whose status is not 2xx.
    pub fn from_response(response: ResponseEnvelope) -> Self {
        let status = response.status;
        Self {
            code: ErrorCode::from_status(status),
            message: format!("Request failed with status code {}", status.as_u16()),
            status: Some(status.as_u16()),
            cause: None,
            response: Some(Box::new(response)),
        }
    }

    /// True when the server produced a response, whatever its status.
    pub fn has_response(&self) -> bool {
        self.status.is_some() || self.response.is_some()
    }

    /// The only fields of an error that are safe to log.
    ///
    /// Request and response bodies and headers are left out on purpose.
    pub fn safe_fields(&self) -> Fields {
        fields(json!({
            "code": self.code.map(ErrorCode::as_str),
            "message": self.message,
            "status": self.status,
            "cause": self.cause,
        }))
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorCode {
    // is_connect() is not available on wasm32 targets (no TCP)
    #[cfg(not(target_arch = "wasm32"))]
    let connect = err.is_connect();
    #[cfg(target_arch = "wasm32")]
    let connect = false;

    if err.is_timeout() {
        if connect {
            ErrorCode::TimedOut
        } else {
            ErrorCode::ConnectionAborted
        }
    } else if err.is_builder() {
        ErrorCode::InvalidUrl
    } else {
        ErrorCode::Network
    }
}
