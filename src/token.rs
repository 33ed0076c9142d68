use std::{fmt, future::Future};

use async_trait::async_trait;

use crate::{HttpClient, Result};

/// Boxed error returned by user-supplied token providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Supplies the `Authorization` value for outgoing requests.
///
/// Called once per attempt and never cached by the client; providers that
/// want caching must do it themselves.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> std::result::Result<String, BoxError>;
}

#[async_trait]
impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<String, BoxError>> + Send,
{
    async fn token(&self) -> std::result::Result<String, BoxError> {
        (self)().await
    }
}

/// A token that never changes.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken").field(&"<redacted>").finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> std::result::Result<String, BoxError> {
        Ok(self.0.clone())
    }
}

/// Customizes a freshly built client, typically by registering its own
/// authentication observers.
///
/// The factory awaits [`AttachTokenProvider::attach`] before handing the
/// client out, and does not inspect what it changed.
#[async_trait]
pub trait AttachTokenProvider: Send + Sync {
    async fn attach(&self, client: &mut HttpClient) -> Result<()>;
}
