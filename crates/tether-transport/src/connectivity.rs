//! Network reachability, checked before a fallback host is tried.
//!
//! A failed attempt on one host says little about the network as a whole.
//! Before moving on to a fallback host the connection manager asks a
//! [`ConnectivityCheck`] whether the internet is reachable at all, so that a
//! client without a network does not walk the whole host list.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::http::{HttpClient, HttpRequest, Method};

/// Endpoint answering `yes` whenever the internet is reachable.
pub const DEFAULT_CONNECTIVITY_CHECK_URL: &str =
    "https://internet-up.tether.io/is-the-internet-up.txt";

/// Answers whether the network is usable right now.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// GET a well-known URL and judge the response.
///
/// The default URL must answer with the body `yes`; for a custom URL any
/// success status counts.
pub struct HttpConnectivityCheck {
    http: Arc<dyn HttpClient>,
    url: Url,
    expect_yes: bool,
    timeout: Duration,
}

impl HttpConnectivityCheck {
    /// Check against [`DEFAULT_CONNECTIVITY_CHECK_URL`].
    ///
    /// # Errors
    ///
    /// Never in practice; the default URL is valid.
    pub fn new(http: Arc<dyn HttpClient>) -> Result<Self, url::ParseError> {
        let url = Url::parse(DEFAULT_CONNECTIVITY_CHECK_URL)?;
        Ok(Self {
            http,
            url,
            expect_yes: true,
            timeout: Duration::from_secs(10),
        })
    }

    /// Check against a custom URL.
    #[must_use]
    pub fn with_url(http: Arc<dyn HttpClient>, url: Url) -> Self {
        Self {
            http,
            url,
            expect_yes: false,
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ConnectivityCheck for HttpConnectivityCheck {
    async fn is_reachable(&self) -> bool {
        let request = HttpRequest {
            method: Method::Get,
            url: self.url.clone(),
            headers: Vec::new(),
            body: None,
            timeout: self.timeout,
        };
        let reachable = match self.http.execute(request).await {
            Ok(response) if !response.is_success() => false,
            Ok(response) if self.expect_yes => response
                .bytes()
                .await
                .is_ok_and(|body| String::from_utf8_lossy(&body).trim() == "yes"),
            Ok(_) => true,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Connectivity check failed");
                false
            }
        };
        debug!(url = %self.url, reachable, "Connectivity check");
        reachable
    }
}
