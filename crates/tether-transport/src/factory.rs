//! Default transport construction.

use std::sync::Arc;

use crate::auth::AuthProvider;
use crate::connectivity::ConnectivityCheck;
#[cfg(feature = "comet")]
use crate::comet::{CometConfig, CometTransport};
use crate::http::HttpClient;
use crate::params::TransportParams;
use crate::traits::{EventSink, Transport, TransportError, TransportFactory, TransportKind};
#[cfg(feature = "websocket")]
use crate::websocket::WebSocketTransport;

/// Builds the WebSocket and Comet transports compiled into this crate.
pub struct DefaultTransportFactory {
    auth: Arc<dyn AuthProvider>,
    http: Option<Arc<dyn HttpClient>>,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
    #[cfg(feature = "comet")]
    comet: CometConfig,
}

impl DefaultTransportFactory {
    /// Factory without an HTTP client; only WebSocket is available.
    #[must_use]
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            auth,
            http: None,
            connectivity: None,
            #[cfg(feature = "comet")]
            comet: CometConfig::default(),
        }
    }

    /// Enable the Comet transports over the given client.
    #[must_use]
    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Check the network before each fallback host.
    #[must_use]
    pub fn with_connectivity_check(mut self, check: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = Some(check);
        self
    }

    #[cfg(feature = "comet")]
    #[must_use]
    pub fn with_comet_config(mut self, config: CometConfig) -> Self {
        self.comet = config;
        self
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn supports(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::WebSocket => cfg!(feature = "websocket"),
            TransportKind::CometStream | TransportKind::CometPoll => {
                cfg!(feature = "comet") && self.http.is_some()
            }
        }
    }

    fn create(
        &self,
        kind: TransportKind,
        params: TransportParams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match kind {
            #[cfg(feature = "websocket")]
            TransportKind::WebSocket => Ok(Box::new(WebSocketTransport::new(
                params,
                sink,
                self.auth.clone(),
            ))),
            #[cfg(feature = "comet")]
            TransportKind::CometStream | TransportKind::CometPoll => {
                let http = self
                    .http
                    .clone()
                    .ok_or(TransportError::Unsupported(kind))?;
                Ok(Box::new(CometTransport::new(
                    kind,
                    params,
                    sink,
                    http,
                    self.auth.clone(),
                    self.comet,
                )?))
            }
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (params, sink);
                Err(TransportError::Unsupported(kind))
            }
        }
    }

    fn connectivity_check(&self) -> Option<Arc<dyn ConnectivityCheck>> {
        self.connectivity.clone()
    }
}
