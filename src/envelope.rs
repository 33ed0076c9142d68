use std::{fmt, time::Duration};

use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{HttpClientError, Result};

/// Per-call request record.
///
/// Observers receive a fresh copy of the caller's envelope on every attempt,
/// so changes they make never leak into the next attempt or another call.
#[derive(Clone)]
pub struct RequestEnvelope {
    pub base_url: Option<String>,
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the client's per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("base_url", &self.base_url)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &RedactedHeaders(&self.headers))
            .field("query", &self.query)
            .field("body", &self.body.as_ref().map(|body| BodyLen(body.len())))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RequestEnvelope {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            base_url: None,
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Sets a header, replacing any previous value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a query string pair.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Serializes `body` as the JSON request payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|err| HttpClientError::Decode(format!("invalid request body: {err}")))?;
        self.body = Some(bytes);
        Ok(self)
    }

    /// Sets a raw request payload.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Joins `base_url` and `url` into the address that is actually called.
    pub fn full_url(&self) -> String {
        resolve_url(self.base_url.as_deref(), &self.url)
    }
}

/// Resolves `url` against an optional base.
///
/// Absolute URLs are returned unchanged, as is everything when the base is
/// missing or empty.
pub fn resolve_url(base_url: Option<&str>, url: &str) -> String {
    if is_absolute_url(url) {
        return url.to_owned();
    }
    match base_url.map(str::trim).filter(|base| !base.is_empty()) {
        Some(base) if url.is_empty() => base.to_owned(),
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        None => url.to_owned(),
    }
}

fn is_absolute_url(url: &str) -> bool {
    url.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}

/// A completed call with a 2xx status.
#[derive(Clone)]
pub struct ResponseEnvelope {
    /// The request as it was sent, after request observers ran.
    pub config: RequestEnvelope,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEnvelope")
            .field("config", &self.config)
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &RedactedHeaders(&self.headers))
            .field("body", &BodyLen(self.body.len()))
            .finish()
    }
}

impl ResponseEnvelope {
    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|err| {
            HttpClientError::Decode(format!(
                "invalid JSON response from {} {}: {err}",
                self.config.method, self.config.url
            ))
        })
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// Canonical reason phrase for a status, or an empty string.
pub(crate) fn status_text(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_owned()
}

struct RedactedHeaders<'a>(&'a HeaderMap);

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0 {
            if is_sensitive_header(name) {
                map.entry(name, &"<redacted>");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

fn is_sensitive_header(name: &HeaderName) -> bool {
    *name == header::AUTHORIZATION
        || *name == header::PROXY_AUTHORIZATION
        || *name == header::COOKIE
        || *name == header::SET_COOKIE
}

struct BodyLen(usize);

impl fmt::Debug for BodyLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes>", self.0)
    }
}
