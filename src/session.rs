//! OAuth2 client-credentials session that plugs into a client through
//! [`AttachTokenProvider`].
//!
//! The access token is fetched lazily on the first request, cached until
//! shortly before it expires, and dropped as soon as the API answers 401.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::{
    header::{self, HeaderValue},
    StatusCode,
};
use serde::Deserialize;

use crate::{
    observer::{RequestObserver, ResponseObserver},
    AttachTokenProvider, HttpClient, HttpClientError, RequestEnvelope, Result, TransportError,
};

/// Tokens are refreshed this long before the server-declared expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Upper bound for a single token endpoint call.
const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials for the client-credentials grant.
#[derive(Clone)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    authorization: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Token session shared by every client it is attached to.
pub struct OidcSession {
    credentials: ClientCredentials,
    http: reqwest::Client,
    timeout: Duration,
    cache: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for OidcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcSession")
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OidcSession {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
            cache: Mutex::new(None),
        }
    }

    /// Bounds each token endpoint call. Defaults to 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Creates a session from environment variables.
    ///
    /// Reads `OIDC_TOKEN_URL`, `OIDC_CLIENT_ID`, `OIDC_CLIENT_SECRET` and,
    /// optionally, `OIDC_SCOPE`. Returns an error if a required variable is
    /// missing or empty.
    pub fn from_env() -> std::result::Result<Self, String> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| format!("missing {name} environment variable"))
        };
        Ok(Self::new(ClientCredentials {
            token_url: required("OIDC_TOKEN_URL")?,
            client_id: required("OIDC_CLIENT_ID")?,
            client_secret: required("OIDC_CLIENT_SECRET")?,
            scope: std::env::var("OIDC_SCOPE")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }))
    }

    /// Returns the `Authorization` value, fetching a new token if needed.
    pub async fn authorization(&self) -> Result<String> {
        if let Some(cached) = self.cached(Instant::now()) {
            return Ok(cached);
        }

        let fetched_at = Instant::now();
        let token = self.fetch_token().await?;
        let token_type = token.token_type.as_deref().unwrap_or("Bearer");
        let authorization = format!("{} {}", normalize_token_type(token_type), token.access_token);
        let expires_at = token.expires_in.and_then(|secs| expiry(fetched_at, secs));

        self.store(Some(CachedToken {
            authorization: authorization.clone(),
            expires_at,
        }));
        Ok(authorization)
    }

    /// Forgets the cached token so the next request fetches a new one.
    pub fn invalidate(&self) {
        self.store(None);
    }

    fn cached(&self, now: Instant) -> Option<String> {
        let guard = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .filter(|cached| cached.is_fresh(now))
            .map(|cached| cached.authorization.clone())
    }

    fn store(&self, token: Option<CachedToken>) {
        match self.cache.lock() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    async fn fetch_token(&self) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        if let Some(scope) = &self.credentials.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(&self.credentials.token_url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| token_error(TransportError::from_reqwest(err).message))?;

        let status = response.status();
        if !status.is_success() {
            return Err(token_error(format!(
                "token endpoint answered with status code {}",
                status.as_u16()
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| token_error(format!("invalid token response: {}", err.without_url())))
    }
}

/// When a token fetched at `fetched_at` should be refreshed.
///
/// A lifetime too large for `Instant` means the token never expires.
fn expiry(fetched_at: Instant, expires_in_secs: u64) -> Option<Instant> {
    fetched_at.checked_add(Duration::from_secs(expires_in_secs).saturating_sub(EXPIRY_MARGIN))
}

fn token_error(message: impl fmt::Display) -> HttpClientError {
    HttpClientError::Observer(format!("oidc session: {message}"))
}

fn normalize_token_type(token_type: &str) -> &str {
    if token_type.eq_ignore_ascii_case("bearer") {
        "Bearer"
    } else {
        token_type
    }
}

#[async_trait]
impl AttachTokenProvider for Arc<OidcSession> {
    async fn attach(&self, client: &mut HttpClient) -> Result<()> {
        let observer = Arc::new(SessionAuthorization {
            session: self.clone(),
        });
        client
            .add_request_observer(observer.clone())
            .add_response_observer(observer);
        Ok(())
    }
}

struct SessionAuthorization {
    session: Arc<OidcSession>,
}

#[async_trait]
impl RequestObserver for SessionAuthorization {
    async fn on_request(&self, request: &mut RequestEnvelope) -> Result<()> {
        let authorization = self.session.authorization().await?;
        let value = HeaderValue::from_str(&authorization)
            .map_err(|_| token_error("access token is not a valid header value"))?;
        request.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

#[async_trait]
impl ResponseObserver for SessionAuthorization {
    async fn on_error(&self, error: HttpClientError) -> HttpClientError {
        let unauthorized = error
            .as_transport()
            .and_then(|transport| transport.status)
            .is_some_and(|status| status == StatusCode::UNAUTHORIZED.as_u16());
        if unauthorized {
            self.session.invalidate();
        }
        error
    }
}
