//! Client options.
//!
//! Every field has a default, so an options file only needs the
//! credentials. Durations are milliseconds.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::Format;
use tether_transport::{
    ApiKey, AuthProvider, ConnectivityCheck, HttpClient, HttpConnectivityCheck, StaticToken,
    TransportKind,
};
use url::Url;

use crate::backoff::Backoff;
use crate::error::ClientError;

/// Options for a [`Realtime`](crate::Realtime) client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// API key, `name:secret`.
    #[serde(default)]
    pub key: Option<String>,

    /// Static access token, used when no key is set.
    #[serde(default)]
    pub token: Option<String>,

    /// Identity for presence and published messages.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Recovery key (or bare connection key) of a previous client instance,
    /// recovered on first connect.
    #[serde(default)]
    pub recover: Option<String>,

    #[serde(default = "default_host")]
    pub realtime_host: String,

    /// Alternate hosts tried after the primary host fails.
    #[serde(default)]
    pub fallback_hosts: Vec<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// Transport kinds in order of preference.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    #[serde(default)]
    pub format: Format,

    /// Receive messages published by this connection.
    #[serde(default = "default_true")]
    pub echo_messages: bool,

    /// Largest bundled publish, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Connect as soon as the client is created.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Hold publishes while not connected instead of failing them.
    #[serde(default = "default_true")]
    pub queue_messages: bool,

    /// URL fetched before fallback hosts are tried; any success status
    /// counts. The default endpoint must answer `yes`.
    #[serde(default)]
    pub connectivity_check_url: Option<String>,

    #[serde(default)]
    pub disable_connectivity_check: bool,

    #[serde(default)]
    pub timeouts: TimeoutOptions,

    #[serde(default)]
    pub retry: RetryOptions,
}

/// Timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutOptions {
    #[serde(default = "default_disconnected_retry")]
    pub disconnected_retry_timeout_ms: u64,

    #[serde(default = "default_suspended_retry")]
    pub suspended_retry_timeout_ms: u64,

    /// Bound on connect, close and ping round trips.
    #[serde(default = "default_realtime_request")]
    pub realtime_request_timeout_ms: u64,

    /// How long the service keeps connection state after a disconnect.
    #[serde(default = "default_connection_state_ttl")]
    pub connection_state_ttl_ms: u64,

    #[serde(default = "default_http_request")]
    pub http_request_timeout_ms: u64,

    /// Longest a Comet receive request may stay open.
    #[serde(default = "default_recv")]
    pub recv_timeout_ms: u64,
}

/// Reconnect backoff and request retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Failed attempts in the disconnected state before suspending.
    #[serde(default = "default_max_disconnected_attempts")]
    pub max_disconnected_attempts: u32,

    /// Retries of a single Comet HTTP request.
    #[serde(default = "default_http_max_retry_count")]
    pub http_max_retry_count: u32,
}

fn default_host() -> String {
    "realtime.tether.io".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::ALL.to_vec()
}

fn default_max_message_size() -> usize {
    65536
}

fn default_disconnected_retry() -> u64 {
    15_000
}

fn default_suspended_retry() -> u64 {
    30_000
}

fn default_realtime_request() -> u64 {
    10_000
}

fn default_connection_state_ttl() -> u64 {
    120_000
}

fn default_http_request() -> u64 {
    15_000
}

fn default_recv() -> u64 {
    90_000
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    15_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_disconnected_attempts() -> u32 {
    8
}

fn default_http_max_retry_count() -> u32 {
    3
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            recover: None,
            realtime_host: default_host(),
            fallback_hosts: Vec::new(),
            port: default_port(),
            tls_port: default_tls_port(),
            tls: true,
            transports: default_transports(),
            format: Format::default(),
            echo_messages: true,
            max_message_size: default_max_message_size(),
            auto_connect: true,
            queue_messages: true,
            connectivity_check_url: None,
            disable_connectivity_check: false,
            timeouts: TimeoutOptions::default(),
            retry: RetryOptions::default(),
        }
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            disconnected_retry_timeout_ms: default_disconnected_retry(),
            suspended_retry_timeout_ms: default_suspended_retry(),
            realtime_request_timeout_ms: default_realtime_request(),
            connection_state_ttl_ms: default_connection_state_ttl(),
            http_request_timeout_ms: default_http_request(),
            recv_timeout_ms: default_recv(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_disconnected_attempts: default_max_disconnected_attempts(),
            http_max_retry_count: default_http_max_retry_count(),
        }
    }
}

impl TimeoutOptions {
    #[must_use]
    pub fn disconnected_retry(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    #[must_use]
    pub fn suspended_retry(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    #[must_use]
    pub fn realtime_request(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    #[must_use]
    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    #[must_use]
    pub fn http_request(&self) -> Duration {
        Duration::from_millis(self.http_request_timeout_ms)
    }

    #[must_use]
    pub fn recv(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl ClientOptions {
    /// Options authenticating with an API key.
    #[must_use]
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Port for the configured TLS mode.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.tls {
            self.tls_port
        } else {
            self.port
        }
    }

    /// Reconnect backoff, capped at the disconnected retry timeout.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(&self.retry, self.timeouts.disconnected_retry())
    }

    /// Credentials provider for the configured key or token.
    ///
    /// # Errors
    ///
    /// Returns an error if neither a key nor a token is set.
    pub fn auth_provider(&self) -> Result<Arc<dyn AuthProvider>, ClientError> {
        match (&self.key, &self.token) {
            (Some(key), _) => Ok(Arc::new(ApiKey::new(key.clone()))),
            (None, Some(token)) => Ok(Arc::new(StaticToken::new(token.clone()))),
            (None, None) => Err(ClientError::InvalidOptions(
                "No key or token configured".to_string(),
            )),
        }
    }

    /// Reachability check over `http`, or `None` when disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured check URL does not parse.
    pub fn connectivity_check(
        &self,
        http: Arc<dyn HttpClient>,
    ) -> Result<Option<Arc<dyn ConnectivityCheck>>, ClientError> {
        if self.disable_connectivity_check {
            return Ok(None);
        }
        let check = match &self.connectivity_check_url {
            Some(url) => HttpConnectivityCheck::with_url(http, parse_check_url(url)?),
            None => HttpConnectivityCheck::new(http)
                .map_err(|e| ClientError::InvalidOptions(e.to_string()))?,
        };
        Ok(Some(Arc::new(
            check.with_timeout(self.timeouts.realtime_request()),
        )))
    }

    /// Check the options for values the client cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid option.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.realtime_host.is_empty() {
            return Err(ClientError::InvalidOptions("Empty realtime host".to_string()));
        }
        if self.transports.is_empty() {
            return Err(ClientError::InvalidOptions("No transports configured".to_string()));
        }
        if self.timeouts.realtime_request_timeout_ms == 0 {
            return Err(ClientError::InvalidOptions(
                "Realtime request timeout must be > 0".to_string(),
            ));
        }
        if let Some(url) = &self.connectivity_check_url {
            parse_check_url(url)?;
        }
        self.backoff().validate()
    }
}

fn parse_check_url(url: &str) -> Result<Url, ClientError> {
    Url::parse(url).map_err(|e| {
        ClientError::InvalidOptions(format!("Invalid connectivity check URL {url:?}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.timeouts.disconnected_retry(), Duration::from_secs(15));
        assert_eq!(options.timeouts.suspended_retry(), Duration::from_secs(30));
        assert_eq!(options.timeouts.realtime_request(), Duration::from_secs(10));
        assert_eq!(options.timeouts.connection_state_ttl(), Duration::from_secs(120));
        assert_eq!(options.max_message_size, 65536);
        assert_eq!(options.retry.http_max_retry_count, 3);
        assert_eq!(options.effective_port(), 443);
        assert_eq!(options.transports, TransportKind::ALL.to_vec());
    }

    #[test]
    fn test_partial_deserialize() {
        let options: ClientOptions = serde_json::from_str(
            r#"{"key":"app.k:s","transports":["comet_poll"],"timeouts":{"realtime_request_timeout_ms":500}}"#,
        )
        .unwrap();
        assert_eq!(options.transports, vec![TransportKind::CometPoll]);
        assert_eq!(options.timeouts.realtime_request(), Duration::from_millis(500));
        assert_eq!(options.timeouts.recv_timeout_ms, 90_000);
        assert!(options.auth_provider().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ClientOptions::with_key("a:b").validate().is_ok());
        let mut options = ClientOptions::with_key("a:b");
        options.transports.clear();
        assert!(options.validate().is_err());
        assert!(ClientOptions::default().auth_provider().is_err());

        let mut options = ClientOptions::with_key("a:b");
        options.connectivity_check_url = Some("not a url".into());
        assert!(options.validate().is_err());
    }

    struct Offline;

    #[async_trait::async_trait]
    impl HttpClient for Offline {
        async fn execute(
            &self,
            _request: tether_transport::HttpRequest,
        ) -> Result<tether_transport::HttpResponse, tether_transport::HttpError> {
            Err(tether_transport::HttpError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_connectivity_check_can_be_disabled() {
        let mut options = ClientOptions::with_key("a:b");
        let check = options.connectivity_check(Arc::new(Offline)).unwrap();
        assert!(!check.unwrap().is_reachable().await);

        options.disable_connectivity_check = true;
        assert!(options.connectivity_check(Arc::new(Offline)).unwrap().is_none());
    }
}
