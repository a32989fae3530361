use futures::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AuthorizationError {
    #[error("No token available: {0}")]
    TokenUnavailable(String),
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(String),
}

/// Attaches credentials to outgoing ingestion requests.
///
/// A failure means no token is available; the sender then persists the
/// batch for later instead of sending it unauthenticated.
pub trait AuthorizationProvider: Send + Sync {
    fn add_authorization_header<'a>(
        &'a self,
        headers: &'a mut HeaderMap,
    ) -> BoxFuture<'a, Result<(), AuthorizationError>>;
}

/// Attaches a fixed bearer token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl AuthorizationProvider for StaticTokenProvider {
    fn add_authorization_header<'a>(
        &'a self,
        headers: &'a mut HeaderMap,
    ) -> BoxFuture<'a, Result<(), AuthorizationError>> {
        Box::pin(async move {
            if self.token.is_empty() {
                return Err(AuthorizationError::TokenUnavailable(
                    "bearer token is empty".to_string(),
                ));
            }
            let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| AuthorizationError::InvalidHeaderValue(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            Ok(())
        })
    }
}
