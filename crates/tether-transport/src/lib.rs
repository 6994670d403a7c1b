//! # tether-transport
//!
//! Transport abstraction layer for the Tether realtime client.
//!
//! This crate provides a unified interface for the physical links a client
//! can use to reach the service:
//!
//! - **WebSocket** - One full-duplex socket, preferred everywhere
//! - **Comet streaming** - HTTP receive requests that stream frames
//! - **Comet polling** - HTTP long polling for hostile networks
//!
//! ## Transport Abstraction
//!
//! All transports implement the [`Transport`] trait and report through an
//! [`EventSink`], allowing the connection manager to be protocol-agnostic.
//!
//! ```rust,ignore
//! use tether_transport::{EventSink, TransportEvent};
//!
//! while let Some(envelope) = events.recv().await {
//!     match envelope.event {
//!         TransportEvent::Connected { connection_id, .. } => { /* activate */ }
//!         TransportEvent::Disconnected(err) => { /* fall back or retry */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod auth;
pub mod connectivity;
pub mod events;
pub mod factory;
pub mod fallback;
pub mod http;
pub mod params;
pub mod request;
pub mod traits;

#[cfg(feature = "comet")]
pub mod comet;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use auth::{ApiKey, AuthParams, AuthProvider, StaticToken, TokenCallback};
pub use connectivity::{ConnectivityCheck, HttpConnectivityCheck, DEFAULT_CONNECTIVITY_CHECK_URL};
pub use factory::DefaultTransportFactory;
pub use fallback::{negotiate_transports, TransportSelector};
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse, Method};
pub use params::{ConnectMode, TransportParams};
pub use request::RequestPolicy;
pub use traits::{
    EventSink, Transport, TransportEnvelope, TransportError, TransportEvent, TransportFactory,
    TransportId, TransportKind,
};

#[cfg(feature = "comet")]
pub use comet::{CometConfig, CometTransport};
#[cfg(feature = "comet")]
pub use http::ReqwestHttpClient;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
