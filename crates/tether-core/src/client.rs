//! Client handles.
//!
//! [`Realtime`] spawns one task that owns the [`ConnectionManager`] and
//! applies commands, transport events and timer expiries one at a time.
//! Handles only send commands and read shared snapshots.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{ErrorInfo, Message, PresenceAction, PresenceMessage};
use tether_transport::{
    AuthProvider, CometConfig, DefaultTransportFactory, HttpClient, ReqwestHttpClient,
    RequestPolicy, TransportEnvelope, TransportFactory,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::{validate_channel_name, ChannelHub, ChannelState, ChannelStateChange, PresenceUpdate};
use crate::encoder::{IdentityEncoder, PayloadEncoder};
use crate::error::ClientError;
use crate::manager::{ConnectionManager, ConnectionSnapshot, PingCompletion};
use crate::options::ClientOptions;
use crate::queue::Completion;
use crate::state::{ConnectionState, ConnectionStateChange};

enum Command {
    Connect,
    Close,
    Ping(PingCompletion),
    RecoveryKey(oneshot::Sender<Option<String>>),
    Register {
        name: String,
        hub: ChannelHub,
    },
    Attach {
        name: String,
        waiter: Completion,
    },
    Detach {
        name: String,
        waiter: Completion,
    },
    Publish {
        name: String,
        messages: Vec<Message>,
        completion: Completion,
    },
    Presence {
        name: String,
        action: PresenceAction,
        data: Option<serde_json::Value>,
        completion: Completion,
    },
    ChannelState {
        name: String,
        reply: oneshot::Sender<Option<ChannelState>>,
    },
    PresenceMembers {
        name: String,
        reply: oneshot::Sender<Vec<PresenceMessage>>,
    },
}

fn apply(manager: &mut ConnectionManager, command: Command) {
    match command {
        Command::Connect => manager.connect(),
        Command::Close => manager.close(),
        Command::Ping(tx) => manager.ping(tx),
        Command::RecoveryKey(reply) => {
            let _ = reply.send(manager.recovery_key());
        }
        Command::Register { name, hub } => manager.register_channel(&name, hub),
        Command::Attach { name, waiter } => manager.attach(&name, waiter),
        Command::Detach { name, waiter } => manager.detach(&name, waiter),
        Command::Publish {
            name,
            messages,
            completion,
        } => manager.publish(&name, messages, completion),
        Command::Presence {
            name,
            action,
            data,
            completion,
        } => manager.publish_presence(&name, action, data, completion),
        Command::ChannelState { name, reply } => {
            let _ = reply.send(manager.channel_state(&name));
        }
        Command::PresenceMembers { name, reply } => {
            let _ = reply.send(manager.presence_members(&name));
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut manager: ConnectionManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEnvelope>,
) {
    let mut handles_dropped = false;
    loop {
        if handles_dropped && manager.state().is_terminal() {
            break;
        }
        let deadline = manager.next_deadline();
        tokio::select! {
            command = commands.recv(), if !handles_dropped => match command {
                Some(command) => apply(&mut manager, command),
                None => {
                    // Keep running until the close completes, so the
                    // transport gets to send CLOSE.
                    debug!("All client handles dropped; closing");
                    handles_dropped = true;
                    manager.close();
                }
            },
            Some(envelope) = events.recv() => manager.on_transport_event(envelope),
            () = sleep_until(deadline) => manager.on_timers(Instant::now()),
        }
    }
    debug!(state = %manager.state(), "Client task finished");
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    states: broadcast::Receiver<ConnectionStateChange>,
    channels: DashMap<String, RealtimeChannel>,
    encoder: Arc<dyn PayloadEncoder>,
}

/// Handle to a realtime connection.
///
/// Cheap to clone. The connection task runs until every handle, including
/// channel handles, has been dropped.
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<Inner>,
}

impl Realtime {
    /// Create a client using the configured key or token.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or carry no credentials.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let auth = options.auth_provider()?;
        Self::with_auth(options, auth)
    }

    /// Create a client with a custom credentials provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_auth(
        options: ClientOptions,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, ClientError> {
        let comet = CometConfig {
            request: RequestPolicy {
                timeout: options.timeouts.http_request(),
                max_retries: options.retry.http_max_retry_count,
                ..RequestPolicy::default()
            },
            recv_timeout: options.timeouts.recv(),
        };
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
        let mut factory = DefaultTransportFactory::new(auth)
            .with_http(http.clone())
            .with_comet_config(comet);
        if let Some(check) = options.connectivity_check(http)? {
            factory = factory.with_connectivity_check(check);
        }
        Self::with_factory(options, Arc::new(factory))
    }

    /// Create a client building transports through `factory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_factory(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        Self::with_encoder(options, factory, Arc::new(IdentityEncoder))
    }

    /// Create a client with a custom factory and payload encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_encoder(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        encoder: Arc<dyn PayloadEncoder>,
    ) -> Result<Self, ClientError> {
        options.validate()?;
        let auto_connect = options.auto_connect;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(options, factory, events_tx);
        let snapshot = manager.watch();
        let states = manager.subscribe();
        tokio::spawn(run(manager, commands_rx, events_rx));

        let client = Self {
            inner: Arc::new(Inner {
                commands,
                snapshot,
                states,
                channels: DashMap::new(),
                encoder,
            }),
        };
        if auto_connect {
            client.connect();
        }
        Ok(client)
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| ClientError::Dropped)
    }

    /// Start connecting. Progress is reported through
    /// [`on_state_change`](Self::on_state_change).
    pub fn connect(&self) {
        if self.command(Command::Connect).is_err() {
            debug!("Connect on a dropped client");
        }
    }

    /// Close the connection and wait until it is closed or failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task is gone.
    pub async fn close(&self) -> Result<ConnectionState, ClientError> {
        info!("Closing connection");
        self.command(Command::Close)?;
        let mut snapshot = self.inner.snapshot.clone();
        let state = snapshot
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| ClientError::Dropped)?
            .state;
        Ok(state)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.inner.snapshot.borrow().connection_id.clone()
    }

    #[must_use]
    pub fn connection_key(&self) -> Option<String> {
        self.inner.snapshot.borrow().connection_key.clone()
    }

    /// Key with which a later client instance can recover this connection
    /// through the `recover` option. `None` before the first connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task is gone.
    pub async fn recovery_key(&self) -> Result<Option<String>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::RecoveryKey(tx))?;
        rx.await.map_err(|_| ClientError::Dropped)
    }

    /// Reason for the last state change that carried one.
    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.snapshot.borrow().error_reason.clone()
    }

    /// Receiver that always holds the latest connection fields.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Subscribe to connection state changes from now on.
    #[must_use]
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.inner.states.resubscribe()
    }

    /// Wait until the connection reaches `state`, or a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task is gone.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<ConnectionState, ClientError> {
        let mut snapshot = self.inner.snapshot.clone();
        let reached = snapshot
            .wait_for(|s| s.state == state || s.state.is_terminal())
            .await
            .map_err(|_| ClientError::Dropped)?
            .state;
        Ok(reached)
    }

    /// Measure the round trip of a HEARTBEAT.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or no echo arrives in time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Ping(tx))?;
        Ok(rx.await.map_err(|_| ClientError::Dropped)??)
    }

    /// Get the handle for a channel, creating the channel on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    pub fn channel(&self, name: &str) -> Result<RealtimeChannel, ClientError> {
        validate_channel_name(name).map_err(ClientError::InvalidChannel)?;
        if let Some(channel) = self.inner.channels.get(name) {
            return Ok(channel.clone());
        }
        let entry = self.inner.channels.entry(name.to_string()).or_insert_with(|| {
            let hub = ChannelHub::default();
            let _ = self.inner.commands.send(Command::Register {
                name: name.to_string(),
                hub: hub.clone(),
            });
            RealtimeChannel {
                name: Arc::from(name),
                hub,
                commands: self.inner.commands.clone(),
                encoder: self.inner.encoder.clone(),
            }
        });
        Ok(entry.clone())
    }

    /// Channels created through this client.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channels.iter().map(|c| c.key().clone()).collect()
    }
}

/// Handle to one channel of a [`Realtime`] connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    name: Arc<str>,
    hub: ChannelHub,
    commands: mpsc::UnboundedSender<Command>,
    encoder: Arc<dyn PayloadEncoder>,
}

impl RealtimeChannel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Dropped)
    }

    async fn complete<F>(&self, build: F) -> Result<(), ClientError>
    where
        F: FnOnce(Completion) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        Ok(rx.await.map_err(|_| ClientError::Dropped)??)
    }

    /// Attach and wait for the service to confirm.
    ///
    /// # Errors
    ///
    /// Returns the reason the attach failed.
    pub async fn attach(&self) -> Result<(), ClientError> {
        let name = self.name.to_string();
        self.complete(|waiter| Command::Attach { name, waiter }).await
    }

    /// Detach and wait for the service to confirm.
    ///
    /// # Errors
    ///
    /// Returns the reason the detach failed.
    pub async fn detach(&self) -> Result<(), ClientError> {
        let name = self.name.to_string();
        self.complete(|waiter| Command::Detach { name, waiter }).await
    }

    /// Publish one message and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the NACK reason, or the connection error that failed the
    /// message.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publish several messages in one frame.
    ///
    /// # Errors
    ///
    /// Returns an encoding error, the NACK reason, or the connection error
    /// that failed the messages.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), ClientError> {
        let messages = messages
            .into_iter()
            .map(|m| self.encoder.encode(&self.name, m))
            .collect::<Result<Vec<_>, _>>()?;
        let name = self.name.to_string();
        self.complete(|completion| Command::Publish {
            name,
            messages,
            completion,
        })
        .await
    }

    /// Messages received on this channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.hub.messages.subscribe()
    }

    #[must_use]
    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.hub.states.subscribe()
    }

    #[must_use]
    pub fn presence_subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.hub.presence.subscribe()
    }

    /// Current channel state.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task is gone.
    pub async fn state(&self) -> Result<ChannelState, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ChannelState {
            name: self.name.to_string(),
            reply,
        })?;
        let state = rx.await.map_err(|_| ClientError::Dropped)?;
        Ok(state.unwrap_or(ChannelState::Initialized))
    }

    /// Members currently present.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task is gone.
    pub async fn presence_members(&self) -> Result<Vec<PresenceMessage>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::PresenceMembers {
            name: self.name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Dropped)
    }

    async fn presence(
        &self,
        action: PresenceAction,
        data: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let name = self.name.to_string();
        self.complete(|completion| Command::Presence {
            name,
            action,
            data,
            completion,
        })
        .await
    }

    /// Enter presence as the configured client id.
    ///
    /// # Errors
    ///
    /// Returns an error if no client id is configured or the service
    /// rejects the event.
    pub async fn presence_enter(&self, data: Option<serde_json::Value>) -> Result<(), ClientError> {
        self.presence(PresenceAction::Enter, data).await
    }

    /// Update this client's presence data.
    ///
    /// # Errors
    ///
    /// Same as [`presence_enter`](Self::presence_enter).
    pub async fn presence_update(&self, data: Option<serde_json::Value>) -> Result<(), ClientError> {
        self.presence(PresenceAction::Update, data).await
    }

    /// Leave presence.
    ///
    /// # Errors
    ///
    /// Same as [`presence_enter`](Self::presence_enter).
    pub async fn presence_leave(&self, data: Option<serde_json::Value>) -> Result<(), ClientError> {
        self.presence(PresenceAction::Leave, data).await
    }
}
