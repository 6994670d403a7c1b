//! Connection parameters shared by every transport.

use std::time::Duration;
use tether_protocol::{agent, Format, PROTOCOL_VERSION};
use url::Url;

use crate::auth::AuthParams;
use crate::traits::TransportError;

/// How the service should treat this connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Start a new connection.
    #[default]
    Clean,
    /// Continue the connection identified by `key`, replaying missed frames.
    Resume { key: String },
    /// Recover a connection from a previous client instance.
    Recover { key: String },
}

impl ConnectMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectMode::Clean => "clean",
            ConnectMode::Resume { .. } => "resume",
            ConnectMode::Recover { .. } => "recover",
        }
    }
}

/// Parameters for one transport attempt against one host.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub mode: ConnectMode,
    pub format: Format,
    /// Ask the service for protocol-level HEARTBEAT frames.
    pub heartbeats: bool,
    pub echo_messages: bool,
    pub client_id: Option<String>,
    /// Discard cached credentials before connecting.
    pub force_auth_refresh: bool,
    /// Bound on the handshake (socket open / first response).
    pub connect_timeout: Duration,
    /// Extra query parameters appended verbatim.
    pub extra: Vec<(String, String)>,
}

impl TransportParams {
    /// Parameters for a clean JSON connection with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            mode: ConnectMode::Clean,
            format: Format::Json,
            heartbeats: false,
            echo_messages: true,
            client_id: None,
            force_auth_refresh: false,
            connect_timeout: Duration::from_secs(10),
            extra: Vec::new(),
        }
    }

    /// Query parameters for the connect request.
    #[must_use]
    pub fn connect_query(&self, auth: &AuthParams) -> Vec<(String, String)> {
        let mut query = vec![auth.query_pair()];
        match &self.mode {
            ConnectMode::Clean => {}
            ConnectMode::Resume { key } => query.push(("resume".into(), key.clone())),
            ConnectMode::Recover { key } => query.push(("recover".into(), key.clone())),
        }
        if let Some(client_id) = &self.client_id {
            query.push(("clientId".into(), client_id.clone()));
        }
        if !self.echo_messages {
            query.push(("echo".into(), "false".into()));
        }
        query.push(("format".into(), self.format.as_str().into()));
        query.push(("heartbeats".into(), self.heartbeats.to_string()));
        query.push(("v".into(), PROTOCOL_VERSION.query_value()));
        query.push(("agent".into(), agent()));
        query.extend(self.extra.iter().cloned());
        query
    }

    fn base(&self, secure: &str, plain: &str, path: &str) -> Result<Url, TransportError> {
        let scheme = if self.tls { secure } else { plain };
        let url = Url::parse(&format!("{scheme}://{}:{}{path}", self.host, self.port))?;
        Ok(url)
    }

    /// WebSocket endpoint with the connect query applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not form a valid URL.
    pub fn websocket_url(&self, auth: &AuthParams) -> Result<Url, TransportError> {
        let mut url = self.base("wss", "ws", "/")?;
        url.query_pairs_mut().extend_pairs(self.connect_query(auth));
        Ok(url)
    }

    /// Root of the Comet endpoints, ending in `/comet/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not form a valid URL.
    pub fn comet_base(&self) -> Result<Url, TransportError> {
        self.base("https", "http", "/comet/")
    }
}
