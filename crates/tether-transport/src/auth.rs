//! Connect-time credentials.
//!
//! Token issuance lives outside this crate; an [`AuthProvider`] only hands
//! the transports whatever query credential they should present, and is
//! asked to refresh it after the service rejects a token.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tether_protocol::{codes, ErrorInfo};
use tokio::sync::Mutex;

use crate::traits::TransportEvent;

/// Credential presented on the connect request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthParams {
    /// `key` query parameter (basic auth with an API key).
    Key(String),
    /// `access_token` query parameter.
    Token(String),
}

impl AuthParams {
    #[must_use]
    pub fn query_pair(&self) -> (String, String) {
        match self {
            AuthParams::Key(key) => ("key".into(), key.clone()),
            AuthParams::Token(token) => ("access_token".into(), token.clone()),
        }
    }
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthParams::Key(_) => f.write_str("AuthParams::Key(..)"),
            AuthParams::Token(_) => f.write_str("AuthParams::Token(..)"),
        }
    }
}

/// Supplies credentials to transports on demand.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Credentials for the next connect request.
    ///
    /// `force_refresh` is set after the service rejected the previous token.
    async fn auth_params(&self, force_refresh: bool) -> Result<AuthParams, ErrorInfo>;
}

/// An API key; never needs refreshing.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

#[async_trait]
impl AuthProvider for ApiKey {
    async fn auth_params(&self, _force_refresh: bool) -> Result<AuthParams, ErrorInfo> {
        Ok(AuthParams::Key(self.0.clone()))
    }
}

/// A fixed token with no means of renewal.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn auth_params(&self, force_refresh: bool) -> Result<AuthParams, ErrorInfo> {
        if force_refresh {
            return Err(ErrorInfo::new(
                40171,
                403,
                "Token rejected and no means provided to renew it",
            ));
        }
        Ok(AuthParams::Token(self.0.clone()))
    }
}

type TokenFn = dyn Fn() -> BoxFuture<'static, Result<String, ErrorInfo>> + Send + Sync;

/// Obtains tokens from a user callback and caches the last one.
pub struct TokenCallback {
    callback: Arc<TokenFn>,
    cached: Mutex<Option<String>>,
}

impl TokenCallback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<String, ErrorInfo>> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AuthProvider for TokenCallback {
    async fn auth_params(&self, force_refresh: bool) -> Result<AuthParams, ErrorInfo> {
        let mut cached = self.cached.lock().await;
        if force_refresh {
            cached.take();
        }
        if let Some(token) = cached.as_ref() {
            return Ok(AuthParams::Token(token.clone()));
        }
        let token = (self.callback)().await?;
        *cached = Some(token.clone());
        Ok(AuthParams::Token(token))
    }
}

/// Event a transport reports when it could not obtain credentials.
///
/// Forbidden means retrying cannot help.
#[must_use]
pub fn auth_failure_event(err: ErrorInfo) -> TransportEvent {
    if err.status_code == 403 {
        TransportEvent::Failed(err)
    } else {
        TransportEvent::Disconnected(err)
    }
}

/// Error used when no credentials are configured at all.
#[must_use]
pub fn no_credentials() -> ErrorInfo {
    ErrorInfo::new(codes::NO_CREDENTIALS, 401, "No key or token configured")
}
