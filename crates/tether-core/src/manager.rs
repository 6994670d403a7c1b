//! Connection manager.
//!
//! The manager owns the logical connection: the state machine, the active
//! transport and at most one transport being tried, the connection id, key
//! and serial, the outbound message queues, the timers and the channel
//! registry. It is a plain synchronous object driven by three inputs:
//! API calls, [`TransportEnvelope`]s from transports, and
//! [`ConnectionManager::on_timers`] once [`ConnectionManager::next_deadline`]
//! has passed. The client task feeds it all three from a single loop.

use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{
    codes, ConnectionDetails, ErrorInfo, Message, PresenceAction, PresenceMessage,
    ProtocolMessage,
};
use tether_transport::{
    negotiate_transports, ConnectMode, EventSink, Transport, TransportEnvelope, TransportEvent,
    TransportFactory, TransportId, TransportKind, TransportParams, TransportSelector,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelHub, ChannelState};
use crate::options::ClientOptions;
use crate::queue::{Completion, MessageQueue, PendingMessage};
use crate::recovery::RecoveryKey;
use crate::router::Channels;
use crate::state::{transition, ConnectionState, ConnectionStateChange, StateEvent};

/// Automatic reconnects from connected are at most this frequent.
const MIN_AUTO_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Receives a ping round-trip time.
pub type PingCompletion = oneshot::Sender<Result<Duration, ErrorInfo>>;

/// Connection fields visible outside the client task.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub error_reason: Option<ErrorInfo>,
}

#[derive(Debug, Default)]
struct ConnectionInfo {
    id: Option<String>,
    key: Option<String>,
    serial: Option<i64>,
    details: ConnectionDetails,
}

/// One host being tried, one transport kind at a time.
struct Attempt {
    host: String,
    kinds: Vec<TransportKind>,
    next_kind: usize,
    mode: ConnectMode,
    transport: Option<Box<dyn Transport>>,
    preconnected: bool,
}

#[derive(Debug, Default)]
struct Timers {
    /// Bounds connecting and closing.
    transition: Option<Instant>,
    /// Connection state TTL while not connected.
    suspend: Option<Instant>,
    /// Next automatic attempt from disconnected or suspended.
    retry: Option<Instant>,
    /// Liveness of the active transport.
    idle: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [self.transition, self.suspend, self.retry, self.idle]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Reachability check running before a fallback host is tried. Its
/// outcome arrives as an envelope tagged with `id`.
struct PendingCheck {
    id: TransportId,
    host: String,
    task: JoinHandle<()>,
}

struct PendingPing {
    id: String,
    started: Instant,
    deadline: Instant,
    tx: PingCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostChoice {
    /// Start over with the primary host.
    FreshPass,
    /// Go straight to a fallback host.
    SkipPrimary,
}

/// Owner of the logical connection.
pub struct ConnectionManager {
    options: ClientOptions,
    backoff: Backoff,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<TransportEnvelope>,
    selector: TransportSelector,
    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    connection: ConnectionInfo,
    msg_serial: u64,
    active: Option<Box<dyn Transport>>,
    attempt: Option<Attempt>,
    check: Option<PendingCheck>,
    current_host: Option<String>,
    /// Not yet handed to the active transport.
    queued: MessageQueue,
    /// Sent on the active transport, awaiting ACK or NACK.
    pending: MessageQueue,
    timers: Timers,
    retry_count: u32,
    suspend_elapsed: bool,
    force_auth_refresh: bool,
    token_retry_used: bool,
    last_activity: Option<Instant>,
    last_auto_reconnect: Option<Instant>,
    deferred_connect: bool,
    channels: Channels,
    pings: Vec<PendingPing>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionManager {
    /// Create a manager. Transports report to `events`; the caller routes
    /// what arrives there back into [`on_transport_event`](Self::on_transport_event).
    #[must_use]
    pub fn new(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Self {
        let kinds = negotiate_transports(&options.transports, |k| factory.supports(k));
        if kinds.is_empty() {
            warn!(requested = ?options.transports, "None of the requested transports is available");
        }
        let selector = TransportSelector::new(
            options.realtime_host.clone(),
            options.fallback_hosts.clone(),
            &kinds,
        );
        let (state_tx, _) = broadcast::channel(64);
        let (snapshot, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Initialized,
            connection_id: None,
            connection_key: None,
            error_reason: None,
        });
        Self {
            backoff: options.backoff(),
            options,
            factory,
            events,
            selector,
            state: ConnectionState::Initialized,
            error_reason: None,
            connection: ConnectionInfo::default(),
            msg_serial: 0,
            active: None,
            attempt: None,
            check: None,
            current_host: None,
            queued: MessageQueue::new(),
            pending: MessageQueue::new(),
            timers: Timers::default(),
            retry_count: 0,
            suspend_elapsed: false,
            force_auth_refresh: false,
            token_retry_used: false,
            last_activity: None,
            last_auto_reconnect: None,
            deferred_connect: false,
            channels: Channels::new(),
            pings: Vec::new(),
            state_tx,
            snapshot,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection.id.as_deref()
    }

    #[must_use]
    pub fn connection_key(&self) -> Option<&str> {
        self.connection.key.as_deref()
    }

    #[must_use]
    pub fn connection_serial(&self) -> Option<i64> {
        self.connection.serial
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// Serial the next new message will get.
    #[must_use]
    pub fn msg_serial(&self) -> u64 {
        self.msg_serial
    }

    /// Messages waiting for a connection.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.count()
    }

    /// Messages sent and awaiting acknowledgement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    /// Key a later client instance can pass as `recover` to take over this
    /// connection, or `None` before the first connection.
    #[must_use]
    pub fn recovery_key(&self) -> Option<String> {
        let connection_key = self.connection.key.clone()?;
        let key = RecoveryKey {
            connection_key,
            msg_serial: self.msg_serial,
        };
        match key.encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!(error = %e, "Unable to encode recovery key");
                None
            }
        }
    }

    /// Kind of the active transport.
    #[must_use]
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.active.as_ref().map(|t| t.kind())
    }

    #[must_use]
    pub fn current_host(&self) -> Option<&str> {
        self.current_host.as_deref()
    }

    #[must_use]
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }

    /// Receiver that always holds the latest [`ConnectionSnapshot`].
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Earliest time at which [`on_timers`](Self::on_timers) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let pings = self.pings.iter().map(|p| p.deadline).min();
        [self.timers.next(), pings].into_iter().flatten().min()
    }

    // --- Lifecycle ---------------------------------------------------------

    /// Start connecting.
    ///
    /// A no-op while connecting or connected; deferred until the close has
    /// completed while closing.
    pub fn connect(&mut self) {
        match transition(self.state, StateEvent::ConnectRequested) {
            None => {
                debug!("Connect requested while closing; deferring");
                self.deferred_connect = true;
            }
            Some(ConnectionState::Connecting) if self.state != ConnectionState::Connecting => {
                if self.state.is_terminal() {
                    self.clear_connection();
                    self.error_reason = None;
                    self.retry_count = 0;
                    self.suspend_elapsed = false;
                    self.selector.forget();
                }
                self.begin_connecting(HostChoice::FreshPass, StateEvent::ConnectRequested);
            }
            _ => {}
        }
    }

    /// Close the connection.
    ///
    /// From connected this asks the service to close and waits for the
    /// confirmation or the request timeout; otherwise it closes at once.
    pub fn close(&mut self) {
        self.deferred_connect = false;
        match transition(self.state, StateEvent::CloseRequested) {
            Some(ConnectionState::Closing) if self.state != ConnectionState::Closing => {
                self.timers.retry = None;
                self.timers.idle = None;
                self.timers.transition =
                    Some(Instant::now() + self.options.timeouts.realtime_request());
                if let Some(transport) = &self.active {
                    transport.request_close();
                }
                self.set_state(ConnectionState::Closing, None, None);
            }
            Some(ConnectionState::Closed) if self.state != ConnectionState::Closed => {
                self.enter_closed(StateEvent::CloseRequested);
            }
            _ => {}
        }
    }

    fn begin_connecting(&mut self, hosts: HostChoice, event: StateEvent) {
        let Some(next) = self.next_state(event) else {
            return;
        };
        self.timers.retry = None;
        self.dispose_attempt();
        self.selector.reset_hosts();
        if hosts == HostChoice::SkipPrimary {
            self.selector.skip_primary();
        }
        if self.timers.suspend.is_none() {
            self.timers.suspend =
                Some(Instant::now() + self.options.timeouts.connection_state_ttl());
        }
        self.set_state(next, None, None);

        let host = self
            .selector
            .next_host()
            .unwrap_or_else(|| self.options.realtime_host.clone());
        self.start_attempt(host);
    }

    fn connect_mode(&mut self) -> ConnectMode {
        if let Some(key) = self.connection.key.clone() {
            if self.within_resume_window() {
                return ConnectMode::Resume { key };
            }
            debug!("Connection state expired; connecting afresh");
            self.clear_connection();
        } else if let Some(recover) = self.options.recover.take() {
            let key = RecoveryKey::parse(&recover);
            self.msg_serial = key.msg_serial;
            return ConnectMode::Recover {
                key: key.connection_key,
            };
        }
        ConnectMode::Clean
    }

    fn within_resume_window(&self) -> bool {
        let Some(last) = self.last_activity else {
            return false;
        };
        let details = &self.connection.details;
        let ttl = details
            .connection_state_ttl
            .map_or(self.options.timeouts.connection_state_ttl(), Duration::from_millis);
        let idle = details
            .max_idle_interval
            .map_or(Duration::ZERO, Duration::from_millis);
        Instant::now().duration_since(last) < ttl + idle
    }

    fn transport_params(&self, host: &str, mode: ConnectMode) -> TransportParams {
        let mut params = TransportParams::new(host, self.options.effective_port(), self.options.tls);
        params.mode = mode;
        params.format = self.options.format;
        params.heartbeats = true;
        params.echo_messages = self.options.echo_messages;
        params.client_id.clone_from(&self.options.client_id);
        params.force_auth_refresh = self.force_auth_refresh;
        params.connect_timeout = self.options.timeouts.realtime_request();
        params
    }

    fn start_attempt(&mut self, host: String) {
        let mode = self.connect_mode();
        info!(host = %host, mode = mode.as_str(), "Connection attempt");
        self.timers.transition = Some(Instant::now() + self.options.timeouts.realtime_request());
        self.current_host = Some(host.clone());
        self.attempt = Some(Attempt {
            host,
            kinds: self.selector.kinds(),
            next_kind: 0,
            mode,
            transport: None,
            preconnected: false,
        });
        self.try_next_kind(None);
    }

    /// Create a transport of the next untried kind on the current host.
    fn try_next_kind(&mut self, mut last_error: Option<ErrorInfo>) {
        loop {
            let Some(attempt) = self.attempt.as_mut() else {
                return;
            };
            let Some(kind) = attempt.kinds.get(attempt.next_kind).copied() else {
                let err = last_error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::DISCONNECTED, 0, "No transport available")
                });
                self.attempt = None;
                self.on_attempt_failed(err, false);
                return;
            };
            attempt.next_kind += 1;
            let (host, mode) = (attempt.host.clone(), attempt.mode.clone());

            let params = self.transport_params(&host, mode);
            let sink = EventSink::new(TransportId::next(), self.events.clone());
            match self.factory.create(kind, params, sink) {
                Ok(transport) => {
                    debug!(transport = %transport.id(), kind = %kind, host = %host, "Transport created");
                    transport.connect();
                    if let Some(attempt) = self.attempt.as_mut() {
                        attempt.transport = Some(transport);
                        attempt.preconnected = false;
                    }
                    return;
                }
                Err(e) => {
                    warn!(kind = %kind, host = %host, error = %e, "Unable to create transport");
                    last_error = Some(ErrorInfo::new(codes::DISCONNECTED, 0, e.to_string()));
                }
            }
        }
    }

    fn dispose_attempt(&mut self) {
        if let Some(check) = self.check.take() {
            check.task.abort();
        }
        if let Some(mut attempt) = self.attempt.take() {
            if let Some(transport) = attempt.transport.take() {
                transport.dispose();
            }
        }
    }

    /// The attempt on the current host is over without a connection.
    fn on_attempt_failed(&mut self, err: ErrorInfo, fatal: bool) {
        self.timers.transition = None;
        self.dispose_attempt();
        if self.state != ConnectionState::Connecting {
            return;
        }
        debug!(code = err.code, status = err.status_code, message = %err.message, "Connection attempt failed");

        if err.is_token_error() && !self.token_retry_used {
            info!("Token rejected; retrying with renewed credentials");
            self.token_retry_used = true;
            self.force_auth_refresh = true;
            let host = self
                .current_host
                .clone()
                .unwrap_or_else(|| self.options.realtime_host.clone());
            self.start_attempt(host);
            return;
        }
        if fatal {
            self.enter_failed(err);
            return;
        }
        if err.is_retriable() && self.selector.has_fallbacks() {
            let host = if self.selector.exhausted() {
                None
            } else {
                self.selector.next_host()
            };
            match host {
                Some(host) => self.try_fallback_host(host),
                None => {
                    info!("All hosts tried");
                    self.enter_disconnected(ErrorInfo::new(
                        codes::DISCONNECTED,
                        404,
                        "Unable to connect (and no more fallback hosts to try)",
                    ));
                }
            }
            return;
        }
        self.enter_disconnected(err);
    }

    /// Try a fallback host once the network is known to be reachable.
    fn try_fallback_host(&mut self, host: String) {
        let Some(check) = self.factory.connectivity_check() else {
            self.start_attempt(host);
            return;
        };
        let id = TransportId::next();
        let sink = EventSink::new(id, self.events.clone());
        debug!(host = %host, "Checking connectivity before trying fallback host");
        self.timers.transition = Some(Instant::now() + self.options.timeouts.realtime_request());
        let task = tokio::spawn(async move {
            let reachable = check.is_reachable().await;
            sink.emit(TransportEvent::Connectivity { reachable });
        });
        self.check = Some(PendingCheck { id, host, task });
    }

    fn on_connectivity(&mut self, reachable: bool) {
        let Some(check) = self.check.take() else {
            return;
        };
        if self.state != ConnectionState::Connecting {
            return;
        }
        if reachable {
            self.start_attempt(check.host);
        } else {
            info!("Network unreachable; not trying further hosts");
            self.enter_disconnected(ErrorInfo::new(
                codes::DISCONNECTED,
                404,
                "Unable to connect (network unreachable)",
            ));
        }
    }

    /// State `event` leads to, or `None` when the current state ignores it.
    fn next_state(&self, event: StateEvent) -> Option<ConnectionState> {
        let next = transition(self.state, event).filter(|next| *next != self.state);
        if next.is_none() {
            debug!(state = %self.state, ?event, "State event ignored");
        }
        next
    }

    fn enter_disconnected(&mut self, err: ErrorInfo) {
        let Some(next) = self.next_state(StateEvent::TransportLost) else {
            return;
        };
        self.dispose_attempt();
        self.timers.transition = None;
        self.retry_count += 1;
        if self.suspend_elapsed || self.retry_count >= self.options.retry.max_disconnected_attempts {
            self.enter_suspended(Some(err), StateEvent::AttemptsExhausted);
            return;
        }
        let delay = self.backoff.delay(self.retry_count);
        self.timers.retry = Some(Instant::now() + delay);
        self.set_state(next, Some(err), Some(delay));
    }

    fn enter_suspended(&mut self, reason: Option<ErrorInfo>, event: StateEvent) {
        let Some(next) = self.next_state(event) else {
            return;
        };
        self.dispose_attempt();
        self.retry_count = 0;
        // Stays set until connected: failed retries return straight here.
        self.suspend_elapsed = true;
        self.timers.transition = None;
        self.timers.suspend = None;
        self.selector.reset_hosts();
        let delay = self.options.timeouts.suspended_retry();
        self.timers.retry = Some(Instant::now() + delay);
        self.set_state(
            next,
            Some(reason.unwrap_or_else(ErrorInfo::suspended)),
            Some(delay),
        );
    }

    fn enter_failed(&mut self, err: ErrorInfo) {
        let Some(next) = self.next_state(StateEvent::Fatal) else {
            return;
        };
        warn!(code = err.code, message = %err.message, "Connection failed");
        self.dispose_attempt();
        self.deactivate_transport();
        self.timers = Timers::default();
        self.clear_connection();
        self.fail_pings(&err);
        self.set_state(next, Some(err), None);
    }

    /// `event` is [`StateEvent::CloseConfirmed`] from closing, otherwise
    /// [`StateEvent::CloseRequested`].
    fn enter_closed(&mut self, event: StateEvent) {
        let Some(next) = self.next_state(event) else {
            return;
        };
        self.dispose_attempt();
        self.deactivate_transport();
        self.timers = Timers::default();
        self.clear_connection();
        self.fail_pings(&ErrorInfo::closed());
        self.set_state(next, None, None);
        if std::mem::take(&mut self.deferred_connect) {
            self.connect();
        }
    }

    fn clear_connection(&mut self) {
        self.connection = ConnectionInfo::default();
        self.last_activity = None;
    }

    fn set_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        self.state = state;
        if reason.is_some() || state == ConnectionState::Connected {
            self.error_reason.clone_from(&reason);
        }
        info!(
            from = %previous,
            to = %state,
            code = reason.as_ref().map(|e| e.code),
            "Connection state change"
        );

        if !state.queue_events() && !state.send_events() {
            let err = match (state, &reason) {
                (ConnectionState::Failed, Some(reason)) => reason.clone(),
                _ => state.default_error(),
            };
            self.queued.complete_all(&err);
            let channel_reason = reason.clone().unwrap_or(err);
            self.channels.on_connection_interrupted(state, &channel_reason);
        }

        self.publish_snapshot();
        let _ = self.state_tx.send(ConnectionStateChange {
            previous,
            current: state,
            reason,
            retry_in,
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(ConnectionSnapshot {
            state: self.state,
            connection_id: self.connection.id.clone(),
            connection_key: self.connection.key.clone(),
            error_reason: self.error_reason.clone(),
        });
    }

    // --- Transport events --------------------------------------------------

    /// Handle an event from any transport.
    ///
    /// Events from transports that are neither active nor being tried are
    /// discarded.
    pub fn on_transport_event(&mut self, envelope: TransportEnvelope) {
        let TransportEnvelope { transport, event } = envelope;
        if self.check.as_ref().is_some_and(|c| c.id == transport) {
            if let TransportEvent::Connectivity { reachable } = event {
                self.on_connectivity(reachable);
            }
            return;
        }
        if self.active.as_ref().is_some_and(|t| t.id() == transport) {
            self.on_active_event(event);
        } else if self
            .attempt
            .as_ref()
            .and_then(|a| a.transport.as_ref())
            .is_some_and(|t| t.id() == transport)
        {
            self.on_attempt_event(event);
        } else {
            trace!(transport = %transport, ?event, "Event from inactive transport discarded");
        }
    }

    fn on_attempt_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Preconnect => {
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.preconnected = true;
                }
            }
            TransportEvent::Connected {
                connection_id,
                details,
                error,
                msg_serial,
                connection_serial,
            } => self.on_connected(connection_id, details, error, msg_serial, connection_serial),
            TransportEvent::Disconnected(err) => self.on_attempt_lost(err, false),
            TransportEvent::Failed(err) => self.on_attempt_lost(err, true),
            TransportEvent::Closed => self.on_attempt_lost(ErrorInfo::closed(), false),
            other => trace!(?other, "Ignoring event before connection"),
        }
    }

    fn on_attempt_lost(&mut self, err: ErrorInfo, fatal: bool) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if let Some(transport) = attempt.transport.take() {
            debug!(transport = %transport.id(), kind = %transport.kind(), code = err.code, "Transport failed");
            transport.dispose();
        }
        let try_next_kind = !fatal && !attempt.preconnected && !err.is_token_error();
        if try_next_kind {
            self.try_next_kind(Some(err));
        } else {
            self.attempt = None;
            self.on_attempt_failed(err, fatal);
        }
    }

    fn on_connected(
        &mut self,
        connection_id: String,
        details: ConnectionDetails,
        error: Option<ErrorInfo>,
        service_msg_serial: Option<u64>,
        connection_serial: Option<i64>,
    ) {
        let Some(next) = self.next_state(StateEvent::TransportConnected) else {
            return;
        };
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        let Some(transport) = attempt.transport.take() else {
            return;
        };
        if let Some(old) = self.active.take() {
            old.dispose();
        }

        let resume_requested = matches!(attempt.mode, ConnectMode::Resume { .. });
        // A recovered connection keeps the serial the recovery key carried.
        let recovered = matches!(attempt.mode, ConnectMode::Recover { .. }) && error.is_none();
        let resumed =
            resume_requested && self.connection.id.as_deref() == Some(connection_id.as_str());
        info!(
            connection = %connection_id,
            transport = %transport.kind(),
            host = %attempt.host,
            resumed,
            "Connected"
        );

        self.selector.remember(transport.kind());
        self.selector.reset_hosts();
        self.timers.transition = None;
        self.timers.suspend = None;
        self.timers.retry = None;
        self.retry_count = 0;
        self.suspend_elapsed = false;
        self.force_auth_refresh = false;
        self.token_retry_used = false;

        if resumed {
            if let Some(next) = service_msg_serial {
                let applied = self.queued.complete_messages(0, next, None);
                if applied > 0 {
                    debug!(applied, "Messages applied before resume completed");
                }
            }
            if let Some(serial) = connection_serial {
                if self.connection.serial.map_or(true, |current| serial > current) {
                    self.connection.serial = Some(serial);
                }
            }
        } else {
            if resume_requested {
                warn!(
                    previous = ?self.connection.id,
                    connection = %connection_id,
                    "Resume rejected; continuing as a new connection"
                );
            }
            let lost = self.queued.complete_serialled(&ErrorInfo::unable_to_recover());
            if lost > 0 {
                warn!(lost, "In-flight messages could not be recovered");
            }
            if !recovered {
                self.msg_serial = 0;
            }
            self.connection.serial = connection_serial;
        }

        self.connection.id = Some(connection_id);
        if details.connection_key.is_some() {
            self.connection.key.clone_from(&details.connection_key);
        }
        self.connection.details = details;
        self.active = Some(transport);
        self.touch();

        self.set_state(next, error, None);

        for frame in self.channels.on_connected(resumed) {
            self.send_frame(frame);
        }
        self.flush_queued();
    }

    fn on_active_event(&mut self, event: TransportEvent) {
        self.touch();
        match event {
            TransportEvent::Preconnect | TransportEvent::Activity => {}
            TransportEvent::Connected {
                connection_id,
                details,
                ..
            } => {
                debug!(connection = %connection_id, "Connection details updated");
                if details.connection_key.is_some() {
                    self.connection.key.clone_from(&details.connection_key);
                }
                self.connection.details = details;
                self.publish_snapshot();
            }
            TransportEvent::Disconnected(err) => self.on_active_lost(err, false),
            TransportEvent::Failed(err) => self.on_active_lost(err, true),
            TransportEvent::Closed => {
                if self.state == ConnectionState::Closing {
                    self.enter_closed(StateEvent::CloseConfirmed);
                } else {
                    self.on_active_lost(ErrorInfo::closed(), false);
                }
            }
            TransportEvent::Ack { serial, count } => {
                trace!(serial, count, "ACK");
                self.pending.complete_messages(serial, count, None);
            }
            TransportEvent::Nack {
                serial,
                count,
                error,
            } => {
                warn!(serial, count, code = error.code, message = %error.message, "NACK");
                self.pending.complete_messages(serial, count, Some(error));
            }
            TransportEvent::Heartbeat { id } => {
                if let Some(id) = id {
                    self.resolve_ping(&id);
                }
            }
            TransportEvent::Channel(frame) => self.on_channel_frame(frame),
            TransportEvent::AuthRequested => {
                info!("Service requested re-authentication");
                if let Some(transport) = &self.active {
                    transport.reauthorize();
                }
            }
            TransportEvent::Connectivity { .. } => {}
        }
    }

    /// Mark inbound activity and push the idle deadline out.
    fn touch(&mut self) {
        let now = Instant::now();
        self.last_activity = Some(now);
        self.timers.idle = self
            .connection
            .details
            .max_idle_interval
            .map(|idle| now + Duration::from_millis(idle) + self.options.timeouts.realtime_request());
    }

    fn deactivate_transport(&mut self) {
        if let Some(transport) = self.active.take() {
            debug!(transport = %transport.id(), "Deactivating transport");
            transport.dispose();
        }
        self.timers.idle = None;
        let mut pending = self.pending.take_all();
        pending.reset_send_attempted();
        self.queued.prepend(pending);
    }

    fn on_active_lost(&mut self, err: ErrorInfo, fatal: bool) {
        self.deactivate_transport();
        match self.state {
            ConnectionState::Closing => self.enter_closed(StateEvent::TransportLost),
            ConnectionState::Connected => {
                if fatal {
                    self.enter_failed(err);
                    return;
                }
                info!(code = err.code, message = %err.message, "Transport lost");
                if err.status_code > 500 && self.selector.has_fallbacks() {
                    self.reconnect_now(err);
                    self.begin_connecting(HostChoice::SkipPrimary, StateEvent::ConnectRequested);
                    return;
                }
                if err.is_token_error() {
                    self.force_auth_refresh = true;
                    self.token_retry_used = true;
                }
                let now = Instant::now();
                let recent = self
                    .last_auto_reconnect
                    .is_some_and(|at| now.duration_since(at) < MIN_AUTO_RECONNECT_INTERVAL);
                if recent {
                    self.enter_disconnected(err);
                } else {
                    self.last_auto_reconnect = Some(now);
                    self.reconnect_now(err);
                    self.begin_connecting(HostChoice::FreshPass, StateEvent::ConnectRequested);
                }
            }
            _ => {}
        }
    }

    /// Report the loss with no retry delay; a new attempt follows at once.
    fn reconnect_now(&mut self, err: ErrorInfo) {
        if let Some(next) = self.next_state(StateEvent::TransportLost) {
            self.set_state(next, Some(err), Some(Duration::ZERO));
        }
    }

    fn on_channel_frame(&mut self, frame: ProtocolMessage) {
        if let Some(serial) = frame.connection_serial {
            if self.connection.serial.is_some_and(|current| serial <= current) {
                debug!(serial, current = ?self.connection.serial, "Duplicate frame discarded");
                return;
            }
            self.connection.serial = Some(serial);
        }
        if let Some(reply) = self.channels.route(frame) {
            self.send_frame(reply);
        }
    }

    // --- Timers ------------------------------------------------------------

    /// Fire every timer due at `now`.
    pub fn on_timers(&mut self, now: Instant) {
        if self.timers.transition.is_some_and(|t| t <= now) {
            self.timers.transition = None;
            self.on_transition_timeout();
        }
        if self.timers.suspend.is_some_and(|t| t <= now) {
            self.timers.suspend = None;
            self.on_suspend_timeout();
        }
        if self.timers.retry.is_some_and(|t| t <= now) {
            self.timers.retry = None;
            self.begin_connecting(HostChoice::FreshPass, StateEvent::RetryTimeout);
        }
        if self.timers.idle.is_some_and(|t| t <= now) {
            self.timers.idle = None;
            self.on_idle_timeout();
        }
        self.expire_pings(now);
    }

    fn on_transition_timeout(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                debug!(host = ?self.current_host, "Connection attempt timed out");
                self.on_attempt_failed(ErrorInfo::timeout("Connection attempt"), false);
            }
            ConnectionState::Closing => {
                debug!("Close not confirmed in time");
                self.enter_closed(StateEvent::CloseConfirmed);
            }
            _ => {}
        }
    }

    fn on_suspend_timeout(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                self.enter_suspended(None, StateEvent::SuspendTimeout);
            }
            ConnectionState::Connecting => self.suspend_elapsed = true,
            _ => {}
        }
    }

    fn on_idle_timeout(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let idle = self.connection.details.max_idle_interval.unwrap_or_default()
            + self.options.timeouts.realtime_request_timeout_ms;
        warn!(idle_ms = idle, "No activity from the service; assuming the transport is dead");
        self.on_active_lost(
            ErrorInfo::new(
                codes::DISCONNECTED,
                408,
                format!("No activity seen from realtime in {idle}ms; assuming connection has dropped"),
            ),
            false,
        );
    }

    // --- Sending -----------------------------------------------------------

    /// Send a frame, queueing it while not connected when `queue_events` is
    /// set. `completion` receives the outcome once the service acknowledged
    /// the frame, or right after sending for frames without acknowledgement.
    pub fn send(
        &mut self,
        frame: ProtocolMessage,
        queue_events: bool,
        completion: Option<Completion>,
    ) {
        let message = PendingMessage::new(frame, completion);
        if self.state.send_events() && self.active.is_some() {
            self.send_now(message);
        } else if queue_events && self.state.queue_events() {
            trace!(state = %self.state, "Queueing message");
            self.queued
                .push_bundled(message, self.options.max_message_size);
        } else {
            let err = match (self.state, &self.error_reason) {
                (ConnectionState::Failed, Some(reason)) => reason.clone(),
                (state, _) => state.default_error(),
            };
            message.complete(Err(err));
        }
    }

    fn send_now(&mut self, mut message: PendingMessage) {
        let Some(transport) = self.active.as_ref() else {
            self.queued.push(message);
            return;
        };
        if message.ack_required && message.msg_serial().is_none() {
            message.message.msg_serial = Some(self.msg_serial);
            self.msg_serial += 1;
        }
        message.send_attempted = true;
        if let Err(e) = transport.send(message.message.clone()) {
            debug!(error = %e, serial = ?message.msg_serial(), "Send failed; awaiting reconnect");
        }
        if message.ack_required {
            self.pending.push(message);
        } else {
            message.complete(Ok(()));
        }
    }

    fn flush_queued(&mut self) {
        let mut queued = self.queued.take_all();
        if !queued.is_empty() {
            debug!(count = queued.count(), "Sending queued messages");
        }
        while let Some(message) = queued.shift() {
            self.send_now(message);
        }
    }

    /// Send a control frame on the active transport, if any.
    fn send_frame(&self, frame: ProtocolMessage) {
        if let Some(transport) = &self.active {
            if let Err(e) = transport.send(frame) {
                debug!(error = %e, "Unable to send control frame");
            }
        }
    }

    /// Send a HEARTBEAT and report the round trip once the service echoes it.
    pub fn ping(&mut self, tx: PingCompletion) {
        if self.state != ConnectionState::Connected {
            let _ = tx.send(Err(ErrorInfo::new(
                codes::DISCONNECTED,
                400,
                "Unable to ping service; not connected",
            )));
            return;
        }
        let id: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        self.send_frame(ProtocolMessage::heartbeat(id.clone()));
        let now = Instant::now();
        self.pings.push(PendingPing {
            id,
            started: now,
            deadline: now + self.options.timeouts.realtime_request(),
            tx,
        });
    }

    fn resolve_ping(&mut self, id: &str) {
        if let Some(pos) = self.pings.iter().position(|p| p.id == id) {
            let ping = self.pings.swap_remove(pos);
            let _ = ping.tx.send(Ok(ping.started.elapsed()));
        }
    }

    fn expire_pings(&mut self, now: Instant) {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.pings.drain(..).partition(|p| p.deadline <= now);
        self.pings = live;
        for ping in expired {
            let _ = ping.tx.send(Err(ErrorInfo::timeout("Ping")));
        }
    }

    fn fail_pings(&mut self, err: &ErrorInfo) {
        for ping in self.pings.drain(..) {
            let _ = ping.tx.send(Err(err.clone()));
        }
    }

    // --- Channels ----------------------------------------------------------

    /// Create a channel, or point an existing one at a new hub.
    pub fn register_channel(&mut self, name: &str, hub: ChannelHub) {
        self.channels.register(name, hub);
    }

    fn channel_unavailable(&self) -> Option<ErrorInfo> {
        match self.state {
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnected => None,
            state => Some(
                self.error_reason
                    .clone()
                    .unwrap_or_else(|| state.default_error()),
            ),
        }
    }

    pub fn attach(&mut self, name: &str, waiter: Completion) {
        if let Some(err) = self.channel_unavailable() {
            let _ = waiter.send(Err(err));
            return;
        }
        let connected = self.state == ConnectionState::Connected;
        if let Some(frame) = self.channels.get_or_create(name).attach(Some(waiter), connected) {
            self.send_frame(frame);
        }
    }

    pub fn detach(&mut self, name: &str, waiter: Completion) {
        let connected = self.state == ConnectionState::Connected;
        let Some(channel) = self.channels.get_mut(name) else {
            let _ = waiter.send(Ok(()));
            return;
        };
        if let Some(frame) = channel.detach(Some(waiter), connected) {
            self.send_frame(frame);
        }
    }

    /// Publish messages on a channel.
    pub fn publish(&mut self, name: &str, messages: Vec<Message>, completion: Completion) {
        if let Err(e) = self.channels.get_or_create(name).check_publish() {
            let _ = completion.send(Err(e));
            return;
        }
        let queue = self.options.queue_messages;
        self.send(ProtocolMessage::message(name, messages), queue, Some(completion));
    }

    /// Enter, update or leave presence on a channel as this client.
    pub fn publish_presence(
        &mut self,
        name: &str,
        action: PresenceAction,
        data: Option<serde_json::Value>,
        completion: Completion,
    ) {
        let Some(client_id) = self.options.client_id.clone() else {
            let _ = completion.send(Err(ErrorInfo::new(
                40012,
                400,
                "Unable to publish presence without a client id",
            )));
            return;
        };
        if let Err(e) = self.channels.get_or_create(name).check_publish() {
            let _ = completion.send(Err(e));
            return;
        }
        let mut member = PresenceMessage::new(
            action,
            client_id,
            self.connection.id.clone().unwrap_or_default(),
            0,
        );
        member.data = data;
        let queue = self.options.queue_messages;
        self.send(ProtocolMessage::presence(name, vec![member]), queue, Some(completion));
    }

    #[must_use]
    pub fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(|c| c.state())
    }

    #[must_use]
    pub fn presence_members(&self, name: &str) -> Vec<PresenceMessage> {
        self.channels
            .get(name)
            .map(|c| c.presence().values().into_iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose_attempt();
        if let Some(transport) = self.active.take() {
            transport.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::TransportError;

    struct NoTransports;

    impl TransportFactory for NoTransports {
        fn supports(&self, _kind: TransportKind) -> bool {
            false
        }

        fn create(
            &self,
            _kind: TransportKind,
            _params: TransportParams,
            _sink: EventSink,
        ) -> Result<Box<dyn Transport>, TransportError> {
            Err(TransportError::Other("unsupported".into()))
        }
    }

    fn manager() -> ConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionManager::new(ClientOptions::with_key("k:s"), Arc::new(NoTransports), tx)
    }

    #[test]
    fn test_timers_pick_earliest() {
        let now = Instant::now();
        let timers = Timers {
            retry: Some(now + Duration::from_secs(5)),
            idle: Some(now + Duration::from_secs(2)),
            ..Default::default()
        };
        assert_eq!(timers.next(), Some(now + Duration::from_secs(2)));
        assert_eq!(Timers::default().next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_transport_available_disconnects() {
        let mut manager = manager();
        let mut states = manager.subscribe();
        manager.connect();

        assert_eq!(states.try_recv().unwrap().current, ConnectionState::Connecting);
        let change = states.try_recv().unwrap();
        assert_eq!(change.current, ConnectionState::Disconnected);
        assert!(change.retry_in.is_some());
        assert_eq!(
            manager.error_reason().map(|e| e.message.as_str()),
            Some("No transport available")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_close_fails_immediately() {
        let mut manager = manager();
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Closed);

        let (tx, mut rx) = oneshot::channel();
        manager.send(ProtocolMessage::message("room", vec![]), true, Some(tx));
        assert_eq!(rx.try_recv().unwrap(), Err(ErrorInfo::closed()));
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unqueued_send_fails_while_connecting() {
        let mut manager = manager();
        let (tx, mut rx) = oneshot::channel();
        manager.send(ProtocolMessage::message("room", vec![]), false, Some(tx));
        assert!(rx.try_recv().unwrap().is_err());

        let (tx, _rx) = oneshot::channel();
        manager.send(ProtocolMessage::message("room", vec![]), true, Some(tx));
        assert_eq!(manager.queued_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_state_change_is_a_transition() {
        const EVENTS: [StateEvent; 9] = [
            StateEvent::ConnectRequested,
            StateEvent::CloseRequested,
            StateEvent::TransportConnected,
            StateEvent::TransportLost,
            StateEvent::AttemptsExhausted,
            StateEvent::SuspendTimeout,
            StateEvent::RetryTimeout,
            StateEvent::CloseConfirmed,
            StateEvent::Fatal,
        ];
        let mut manager = manager();
        let mut states = manager.subscribe();
        manager.connect();
        for _ in 0..20 {
            let Some(deadline) = manager.next_deadline() else {
                break;
            };
            tokio::time::advance(deadline.saturating_duration_since(Instant::now())).await;
            manager.on_timers(Instant::now());
        }
        manager.close();

        let mut seen = Vec::new();
        while let Ok(change) = states.try_recv() {
            assert!(
                EVENTS
                    .iter()
                    .any(|e| transition(change.previous, *e) == Some(change.current)),
                "{} -> {} is not a transition",
                change.previous,
                change.current
            );
            seen.push(change.current);
        }
        assert!(seen.contains(&ConnectionState::Suspended));
        assert_eq!(seen.last(), Some(&ConnectionState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_follows_state() {
        let mut manager = manager();
        let snapshot = manager.watch();
        manager.close();
        assert_eq!(snapshot.borrow().state, ConnectionState::Closed);
    }
}
