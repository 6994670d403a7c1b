//! Scripted transports for driving the connection manager in tests.
//!
//! Transports built by [`MockFactory`] never do I/O. Tests play the service
//! by injecting [`TransportEvent`]s and inspect what the manager sent.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{ClientOptions, ConnectionManager};
use tether_protocol::{ConnectionDetails, ProtocolMessage};
use tether_transport::{
    ConnectMode, ConnectivityCheck, EventSink, Transport, TransportEnvelope, TransportError,
    TransportEvent, TransportFactory, TransportId, TransportKind, TransportParams,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the factory was asked to build.
#[derive(Debug, Clone)]
pub struct Created {
    pub id: TransportId,
    pub kind: TransportKind,
    pub host: String,
    pub mode: ConnectMode,
    pub force_auth_refresh: bool,
    pub sink: EventSink,
}

#[derive(Debug, Default)]
pub struct Log {
    pub created: Vec<Created>,
    pub sent: Vec<(TransportId, ProtocolMessage)>,
    pub close_requests: Vec<TransportId>,
    pub reauthorized: Vec<TransportId>,
    pub disposed: Vec<TransportId>,
}

struct MockTransport {
    id: TransportId,
    kind: TransportKind,
    host: String,
    log: Arc<Mutex<Log>>,
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) {}

    fn send(&self, frame: ProtocolMessage) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        if log.disposed.contains(&self.id) {
            return Err(TransportError::ConnectionClosed);
        }
        log.sent.push((self.id, frame));
        Ok(())
    }

    fn request_close(&self) {
        self.log.lock().unwrap().close_requests.push(self.id);
    }

    fn reauthorize(&self) {
        self.log.lock().unwrap().reauthorized.push(self.id);
    }

    fn dispose(&self) {
        let mut log = self.log.lock().unwrap();
        if !log.disposed.contains(&self.id) {
            log.disposed.push(self.id);
        }
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Connectivity check with a scripted answer.
#[derive(Debug)]
pub struct Reachability {
    pub reachable: AtomicBool,
    pub checks: AtomicU32,
}

impl Reachability {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            checks: AtomicU32::new(0),
        })
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityCheck for Reachability {
    async fn is_reachable(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub log: Arc<Mutex<Log>>,
    /// Kinds `supports` rejects.
    pub unsupported: Vec<TransportKind>,
    pub connectivity: Option<Arc<Reachability>>,
}

impl TransportFactory for MockFactory {
    fn supports(&self, kind: TransportKind) -> bool {
        !self.unsupported.contains(&kind)
    }

    fn connectivity_check(&self) -> Option<Arc<dyn ConnectivityCheck>> {
        self.connectivity
            .clone()
            .map(|check| check as Arc<dyn ConnectivityCheck>)
    }

    fn create(
        &self,
        kind: TransportKind,
        params: TransportParams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let id = sink.id();
        self.log.lock().unwrap().created.push(Created {
            id,
            kind,
            host: params.host.clone(),
            mode: params.mode.clone(),
            force_auth_refresh: params.force_auth_refresh,
            sink,
        });
        Ok(Box::new(MockTransport {
            id,
            kind,
            host: params.host,
            log: self.log.clone(),
        }))
    }
}

pub fn options() -> ClientOptions {
    let mut options = ClientOptions::with_key("app.key:secret");
    options.transports = vec![TransportKind::WebSocket];
    options.client_id = Some("alice".into());
    options
}

pub fn details(key: &str) -> ConnectionDetails {
    ConnectionDetails {
        connection_key: Some(key.to_string()),
        max_idle_interval: Some(15_000),
        connection_state_ttl: Some(120_000),
        ..Default::default()
    }
}

/// A manager wired to a [`MockFactory`].
pub struct Harness {
    pub manager: ConnectionManager,
    pub log: Arc<Mutex<Log>>,
    events: mpsc::UnboundedReceiver<TransportEnvelope>,
}

impl Harness {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_factory(options, MockFactory::default())
    }

    pub fn with_factory(options: ClientOptions, factory: MockFactory) -> Self {
        let log = factory.log.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            manager: ConnectionManager::new(options, Arc::new(factory), tx),
            log,
            events: rx,
        }
    }

    pub fn created(&self) -> Vec<Created> {
        self.log.lock().unwrap().created.clone()
    }

    /// Most recently created transport.
    pub fn last(&self) -> Created {
        self.created().last().cloned().expect("no transport created")
    }

    pub fn emit(&mut self, transport: TransportId, event: TransportEvent) {
        self.manager
            .on_transport_event(TransportEnvelope { transport, event });
    }

    /// Complete the handshake on the latest transport.
    pub fn accept(&mut self, connection_id: &str, key: &str, msg_serial: Option<u64>) -> TransportId {
        let id = self.last().id;
        self.emit(id, TransportEvent::Preconnect);
        self.emit(
            id,
            TransportEvent::Connected {
                connection_id: connection_id.to_string(),
                details: details(key),
                error: None,
                msg_serial,
                connection_serial: None,
            },
        );
        id
    }

    /// Frames sent on `transport`.
    pub fn sent(&self, transport: TransportId) -> Vec<ProtocolMessage> {
        self.log
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(id, _)| *id == transport)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn disposed(&self, transport: TransportId) -> bool {
        self.log.lock().unwrap().disposed.contains(&transport)
    }

    /// Let spawned tasks run, then deliver the events they emitted.
    pub async fn pump(&mut self) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        while let Ok(envelope) = self.events.try_recv() {
            self.manager.on_transport_event(envelope);
        }
    }

    pub fn reauthorized(&self) -> Vec<TransportId> {
        self.log.lock().unwrap().reauthorized.clone()
    }

    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.manager.on_timers(Instant::now());
    }

    /// Move time to the next deadline and fire it.
    pub async fn fire_next_timer(&mut self) {
        let deadline = self.manager.next_deadline().expect("no timer armed");
        let now = Instant::now();
        if deadline > now {
            tokio::time::advance(deadline - now).await;
        }
        self.manager.on_timers(Instant::now());
    }
}
