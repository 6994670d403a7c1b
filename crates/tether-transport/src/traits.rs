//! Transport abstraction traits for Tether.
//!
//! A transport owns one physical link to one host. It reports everything it
//! observes through an [`EventSink`]; the connection manager decides what the
//! events mean for the logical connection. Transports never retry and never
//! change connection state on their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_protocol::{ConnectionDetails, ErrorInfo, ProtocolMessage};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connectivity::ConnectivityCheck;
use crate::params::TransportParams;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl TransportId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// The transport variants, in default order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One full-duplex WebSocket.
    #[serde(rename = "websocket", alias = "web_socket")]
    WebSocket,
    /// HTTP requests whose receive responses stay open and stream frames.
    CometStream,
    /// HTTP long polling: one receive request per batch of frames.
    CometPoll,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::WebSocket,
        TransportKind::CometStream,
        TransportKind::CometPoll,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::CometStream => "comet_stream",
            TransportKind::CometPoll => "comet_poll",
        }
    }

    #[must_use]
    pub fn is_comet(self) -> bool {
        !matches!(self, TransportKind::WebSocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transport can tell the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The physical link is open (socket open, first HTTP response byte).
    Preconnect,
    /// The service confirmed the connection.
    Connected {
        connection_id: String,
        details: ConnectionDetails,
        /// Set when the service could not resume and issued a new connection.
        error: Option<ErrorInfo>,
        /// Next serial the service expects; earlier serials were applied.
        msg_serial: Option<u64>,
        connection_serial: Option<i64>,
    },
    /// The link is gone; the connection may be resumed elsewhere.
    Disconnected(ErrorInfo),
    /// The service refused the connection for good.
    Failed(ErrorInfo),
    /// The service confirmed a requested close.
    Closed,
    Ack {
        serial: u64,
        count: u64,
    },
    Nack {
        serial: u64,
        count: u64,
        error: ErrorInfo,
    },
    Heartbeat {
        id: Option<String>,
    },
    /// Liveness without payload (WebSocket ping, completed HTTP request).
    Activity,
    /// A frame addressed to a channel.
    Channel(ProtocolMessage),
    /// The service asked for renewed credentials on the live connection.
    AuthRequested,
    /// Outcome of a [`ConnectivityCheck`](crate::ConnectivityCheck) run on
    /// the manager's behalf; the envelope carries the id the check was
    /// started under.
    Connectivity { reachable: bool },
}

impl TransportEvent {
    /// Events after which the transport delivers nothing further.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportEvent::Disconnected(_) | TransportEvent::Failed(_) | TransportEvent::Closed
        )
    }
}

/// An event tagged with the transport that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEnvelope {
    pub transport: TransportId,
    pub event: TransportEvent,
}

#[derive(Debug, Default)]
struct SinkState {
    detached: AtomicBool,
    finished: AtomicBool,
    connected: AtomicBool,
}

/// Per-transport handle onto the connection manager's event queue.
///
/// Once [`detach`](EventSink::detach) has been called, or a terminal event
/// has been delivered, every later emit is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: TransportId,
    tx: mpsc::UnboundedSender<TransportEnvelope>,
    state: Arc<SinkState>,
}

impl EventSink {
    #[must_use]
    pub fn new(id: TransportId, tx: mpsc::UnboundedSender<TransportEnvelope>) -> Self {
        Self {
            id,
            tx,
            state: Arc::new(SinkState::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Deliver an event. Returns `false` if it was dropped.
    pub fn emit(&self, event: TransportEvent) -> bool {
        if self.is_detached() || self.state.finished.load(Ordering::SeqCst) {
            return false;
        }
        match &event {
            TransportEvent::Connected { .. } => self.state.connected.store(true, Ordering::SeqCst),
            e if e.is_terminal() => {
                self.state.connected.store(false, Ordering::SeqCst);
                if self.state.finished.swap(true, Ordering::SeqCst) {
                    return false;
                }
            }
            _ => {}
        }
        self.tx
            .send(TransportEnvelope {
                transport: self.id,
                event,
            })
            .is_ok()
    }

    /// Stop delivering events.
    pub fn detach(&self) {
        self.state.detached.store(true, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.state.detached.load(Ordering::SeqCst)
    }

    /// A CONNECTED frame has been seen and no terminal event since.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// No further I/O is useful: detached or finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.is_detached() || self.state.finished.load(Ordering::SeqCst)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Transport kind not compiled in or not configured.
    #[error("Unsupported transport: {0}")]
    Unsupported(TransportKind),

    /// Endpoint could not be built.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// One physical link to the service.
///
/// All methods return immediately; outcomes arrive through the transport's
/// [`EventSink`]. Implementations spawn their I/O on the ambient tokio runtime.
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    /// Host this transport connects to.
    fn host(&self) -> &str;

    /// Start the handshake.
    fn connect(&self);

    /// Hand a frame to the link. Never retries.
    ///
    /// # Errors
    ///
    /// Returns an error only when the link is known to be broken.
    fn send(&self, frame: ProtocolMessage) -> Result<(), TransportError>;

    /// Ask the service to close the connection.
    fn request_close(&self);

    /// Abort all I/O. Idempotent; no events are delivered afterwards.
    fn dispose(&self);

    /// The service confirmed the connection and the link is still up.
    fn is_connected(&self) -> bool;

    /// Fetch renewed credentials and present them on the live link.
    ///
    /// Links without renewable credentials ignore this.
    fn reauthorize(&self) {}
}

/// Builds transports for the connection manager.
pub trait TransportFactory: Send + Sync {
    /// Whether this factory can build the given kind.
    fn supports(&self, kind: TransportKind) -> bool;

    /// Build an unconnected transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unsupported or the endpoint is invalid.
    fn create(
        &self,
        kind: TransportKind,
        params: TransportParams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;

    /// Check to run before trying a fallback host; `None` skips it.
    fn connectivity_check(&self) -> Option<Arc<dyn ConnectivityCheck>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(TransportId::next(), tx), rx)
    }

    #[test]
    fn test_transport_ids_are_unique() {
        let a = TransportId::next();
        let b = TransportId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("transport-"));
    }

    #[test]
    fn test_detached_sink_drops_events() {
        let (sink, mut rx) = sink();
        assert!(sink.emit(TransportEvent::Preconnect));
        sink.detach();
        assert!(!sink.emit(TransportEvent::Activity));

        assert_eq!(rx.try_recv().unwrap().event, TransportEvent::Preconnect);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_single_terminal_event() {
        let (sink, mut rx) = sink();
        assert!(sink.emit(TransportEvent::Connected {
            connection_id: "c1".into(),
            details: ConnectionDetails::default(),
            error: None,
            msg_serial: None,
            connection_serial: None,
        }));
        assert!(sink.is_connected());

        assert!(sink.emit(TransportEvent::Disconnected(ErrorInfo::disconnected())));
        assert!(!sink.emit(TransportEvent::Closed));
        assert!(!sink.is_connected());
        assert!(sink.is_closed());

        assert!(matches!(rx.try_recv().unwrap().event, TransportEvent::Connected { .. }));
        assert!(matches!(rx.try_recv().unwrap().event, TransportEvent::Disconnected(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(TransportKind::CometStream.to_string(), "comet_stream");
        let kind: TransportKind = serde_json::from_str("\"web_socket\"").unwrap();
        assert_eq!(kind, TransportKind::WebSocket);
        assert!(TransportKind::CometPoll.is_comet());
    }
}
