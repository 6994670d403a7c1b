//! Channel state and inbound frame handling.
//!
//! A [`Channel`] tracks the attach/detach handshake for one channel name,
//! applies presence frames to its [`PresenceMap`] and fans inbound messages
//! out to subscribers. It never talks to a transport: operations return the
//! frame to send, and the connection manager decides when it goes out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_protocol::{
    codes, flags, Action, ErrorInfo, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::presence::PresenceMap;
use crate::queue::Completion;
use crate::state::ConnectionState;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast capacity for channel subscribers.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Milliseconds since the epoch, used to timestamp synthesized leaves.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// The attach continued a previous attachment without message loss.
    pub resumed: bool,
}

/// A presence event and whether it changed the membership map.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub member: PresenceMessage,
    pub applied: bool,
}

/// Broadcast senders shared between a channel and its handles.
#[derive(Debug, Clone)]
pub struct ChannelHub {
    pub messages: broadcast::Sender<Arc<Message>>,
    pub presence: broadcast::Sender<PresenceUpdate>,
    pub states: broadcast::Sender<ChannelStateChange>,
}

impl ChannelHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        let (states, _) = broadcast::channel(capacity);
        Self {
            messages,
            presence,
            states,
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// One channel multiplexed over the connection.
#[derive(Debug)]
pub struct Channel {
    name: String,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    presence: PresenceMap,
    attach_waiters: Vec<Completion>,
    detach_waiters: Vec<Completion>,
    hub: ChannelHub,
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<String>, hub: ChannelHub) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            error_reason: None,
            presence: PresenceMap::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            hub,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    #[must_use]
    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn set_hub(&mut self, hub: ChannelHub) {
        self.hub = hub;
    }

    /// Whether a publish on this channel may proceed.
    ///
    /// # Errors
    ///
    /// Returns the failure reason of a failed channel.
    pub fn check_publish(&self) -> Result<(), ErrorInfo> {
        if self.state == ChannelState::Failed {
            return Err(self.error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::CHANNEL_FAILED, 400, "Channel failed")
            }));
        }
        Ok(())
    }

    fn set_state(&mut self, state: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        if reason.is_some() || matches!(state, ChannelState::Attached | ChannelState::Detached) {
            self.error_reason.clone_from(&reason);
        }
        if state == self.state && reason.is_none() {
            return;
        }
        let previous = self.state;
        self.state = state;
        debug!(channel = %self.name, from = %previous, to = %state, "Channel state change");
        let _ = self.hub.states.send(ChannelStateChange {
            previous,
            current: state,
            reason,
            resumed,
        });
    }

    fn fail_waiters(&mut self, err: &ErrorInfo) {
        for waiter in self.attach_waiters.drain(..).chain(self.detach_waiters.drain(..)) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Every member leaves. Members whose record is newer than the local
    /// clock still get a leave before the map is emptied.
    fn leave_all(&mut self) {
        for leave in self.presence.synthesize_leaves(now_millis()) {
            let _ = self.hub.presence.send(PresenceUpdate {
                member: leave,
                applied: true,
            });
        }
        for member in self.presence.clear() {
            self.announce_departure(member);
        }
    }

    /// Request an attach. Returns the ATTACH frame to send, if any.
    pub fn attach(&mut self, waiter: Option<Completion>, connected: bool) -> Option<ProtocolMessage> {
        match self.state {
            ChannelState::Attached => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                None
            }
            ChannelState::Attaching => {
                self.attach_waiters.extend(waiter);
                None
            }
            _ => {
                let err = ErrorInfo::new(codes::CHANNEL_FAILED, 400, "Attach superseded by detach");
                for w in self.detach_waiters.drain(..) {
                    let _ = w.send(Err(err.clone()));
                }
                self.attach_waiters.extend(waiter);
                self.set_state(ChannelState::Attaching, None, false);
                connected.then(|| ProtocolMessage::attach(self.name.clone()))
            }
        }
    }

    /// Request a detach. Returns the DETACH frame to send, if any.
    pub fn detach(&mut self, waiter: Option<Completion>, connected: bool) -> Option<ProtocolMessage> {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                None
            }
            ChannelState::Detaching => {
                self.detach_waiters.extend(waiter);
                None
            }
            ChannelState::Failed => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(self.check_publish());
                }
                None
            }
            ChannelState::Suspended => {
                self.set_state(ChannelState::Detached, None, false);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                None
            }
            ChannelState::Attaching | ChannelState::Attached => {
                let err = ErrorInfo::new(codes::CHANNEL_FAILED, 400, "Attach superseded by detach");
                for w in self.attach_waiters.drain(..) {
                    let _ = w.send(Err(err.clone()));
                }
                if connected {
                    self.detach_waiters.extend(waiter);
                    self.set_state(ChannelState::Detaching, None, false);
                    Some(ProtocolMessage::detach(self.name.clone()))
                } else {
                    self.leave_all();
                    self.set_state(ChannelState::Detached, None, false);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Ok(()));
                    }
                    None
                }
            }
        }
    }

    /// Handle a frame addressed to this channel.
    ///
    /// Returns a frame to send in response, if any.
    pub fn on_frame(&mut self, frame: ProtocolMessage) -> Option<ProtocolMessage> {
        match frame.action {
            Action::Attached => {
                self.on_attached(frame);
                None
            }
            Action::Detached => self.on_detached(frame),
            Action::Message => {
                self.on_messages(frame);
                None
            }
            Action::Presence => {
                self.on_presence(frame, None);
                None
            }
            Action::Sync => {
                let serial = frame.channel_serial.clone();
                self.presence.start_sync();
                self.on_presence(frame, serial.as_deref());
                None
            }
            Action::Error => {
                let err = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(codes::CHANNEL_FAILED, 400, "Channel error"));
                warn!(channel = %self.name, error = %err, "Channel error");
                self.fail_waiters(&err);
                self.leave_all();
                self.set_state(ChannelState::Failed, Some(err), false);
                None
            }
            other => {
                trace!(channel = %self.name, action = %other, "Ignoring channel frame");
                None
            }
        }
    }

    fn on_attached(&mut self, frame: ProtocolMessage) {
        if self.state == ChannelState::Detaching {
            return;
        }
        let resumed = frame.has_flag(flags::RESUMED);
        if frame.has_flag(flags::HAS_PRESENCE) {
            self.presence.start_sync();
        } else {
            self.presence.start_sync();
            for member in self.presence.end_sync() {
                self.announce_departure(member);
            }
        }
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.set_state(ChannelState::Attached, frame.error, resumed);
    }

    fn on_detached(&mut self, frame: ProtocolMessage) -> Option<ProtocolMessage> {
        match self.state {
            ChannelState::Detaching => {
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.leave_all();
                self.set_state(ChannelState::Detached, frame.error, false);
                None
            }
            ChannelState::Attaching if frame.error.is_some() => {
                let err = frame.error.unwrap_or_else(ErrorInfo::failed);
                self.fail_waiters(&err);
                self.set_state(ChannelState::Failed, Some(err), false);
                None
            }
            ChannelState::Attached | ChannelState::Attaching => {
                debug!(channel = %self.name, "Detached by service; reattaching");
                self.set_state(ChannelState::Attaching, frame.error, false);
                Some(ProtocolMessage::attach(self.name.clone()))
            }
            _ => None,
        }
    }

    fn on_messages(&mut self, frame: ProtocolMessage) {
        let frame_id = frame.id.clone().unwrap_or_default();
        for (index, mut message) in frame.messages.into_iter().flatten().enumerate() {
            if message.id.is_none() {
                message.id = Some(format!("{frame_id}:{index}"));
            }
            if message.connection_id.is_none() {
                message.connection_id.clone_from(&frame.connection_id);
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            let _ = self.hub.messages.send(Arc::new(message));
        }
    }

    /// Apply PRESENCE or SYNC members. `sync_serial` is set for SYNC frames;
    /// an empty cursor after the `:` ends the sync.
    fn on_presence(&mut self, frame: ProtocolMessage, sync_serial: Option<&str>) {
        let frame_id = frame.id.clone().unwrap_or_default();
        for (index, mut member) in frame.presence.into_iter().flatten().enumerate() {
            if member.connection_id.is_empty() {
                member.connection_id = frame.connection_id.clone().unwrap_or_default();
            }
            if member.timestamp == 0 {
                member.timestamp = frame.timestamp.unwrap_or_default();
            }
            if member.id.is_none() {
                member.id = Some(format!("{frame_id}:{index}"));
            }
            let applied = match member.action {
                PresenceAction::Leave | PresenceAction::Absent => self.presence.remove(&member),
                _ => self.presence.put(member.clone()),
            };
            let _ = self.hub.presence.send(PresenceUpdate { member, applied });
        }
        let sync_done = match sync_serial {
            Some(serial) => serial.split_once(':').map_or(true, |(_, cursor)| cursor.is_empty()),
            None => false,
        };
        if sync_done {
            for member in self.presence.end_sync() {
                self.announce_departure(member);
            }
        }
    }

    fn announce_departure(&mut self, member: PresenceMessage) {
        let mut leave = member;
        leave.action = PresenceAction::Leave;
        leave.timestamp = now_millis();
        leave.id = None;
        let _ = self.hub.presence.send(PresenceUpdate {
            member: leave,
            applied: true,
        });
    }

    /// The connection became connected. Returns the frame this channel needs
    /// to send, if any.
    ///
    /// When the connection was not resumed, attached channels lose their
    /// presence and attach again.
    pub fn on_connected(&mut self, resumed: bool) -> Option<ProtocolMessage> {
        match self.state {
            ChannelState::Attaching => Some(ProtocolMessage::attach(self.name.clone())),
            ChannelState::Attached | ChannelState::Suspended if !resumed => {
                self.leave_all();
                self.set_state(ChannelState::Attaching, None, false);
                Some(ProtocolMessage::attach(self.name.clone()))
            }
            ChannelState::Suspended => {
                self.set_state(ChannelState::Attaching, None, false);
                Some(ProtocolMessage::attach(self.name.clone()))
            }
            ChannelState::Detaching => Some(ProtocolMessage::detach(self.name.clone())),
            _ => None,
        }
    }

    /// The connection entered a state in which channels cannot operate.
    pub fn on_connection_interrupted(&mut self, state: ConnectionState, reason: &ErrorInfo) {
        let next = match (state, self.state) {
            (
                ConnectionState::Suspended,
                ChannelState::Attaching | ChannelState::Attached,
            ) => ChannelState::Suspended,
            (ConnectionState::Suspended, ChannelState::Detaching) => ChannelState::Detached,
            (
                ConnectionState::Closing | ConnectionState::Closed,
                ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended,
            ) => ChannelState::Detached,
            (
                ConnectionState::Failed,
                ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended,
            ) => ChannelState::Failed,
            _ => return,
        };
        self.fail_waiters(reason);
        self.leave_all();
        self.set_state(next, Some(reason.clone()), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn attached(channel: &str, flags: u32) -> ProtocolMessage {
        ProtocolMessage {
            channel: Some(channel.into()),
            flags: Some(flags),
            ..ProtocolMessage::new(Action::Attached)
        }
    }

    fn presence(channel: &str, action: PresenceAction, client: &str, ts: u64) -> ProtocolMessage {
        ProtocolMessage::presence(channel, vec![PresenceMessage::new(action, client, "c1", ts)])
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("valid:channel").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("bad\nname").is_err());
        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_attach_handshake() {
        let mut channel = Channel::new("room", ChannelHub::default());
        let mut states = channel.hub().states.subscribe();
        let (tx, mut rx) = oneshot::channel();

        let frame = channel.attach(Some(tx), true).unwrap();
        assert_eq!(frame.action, Action::Attach);
        assert_eq!(channel.state(), ChannelState::Attaching);

        assert!(channel.on_frame(attached("room", 0)).is_none());
        assert_eq!(channel.state(), ChannelState::Attached);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        assert_eq!(states.try_recv().unwrap().current, ChannelState::Attaching);
        assert_eq!(states.try_recv().unwrap().current, ChannelState::Attached);
    }

    #[test]
    fn test_attach_while_disconnected_waits_for_connection() {
        let mut channel = Channel::new("room", ChannelHub::default());
        assert!(channel.attach(None, false).is_none());
        assert_eq!(channel.state(), ChannelState::Attaching);

        let frame = channel.on_connected(false).unwrap();
        assert_eq!(frame.action, Action::Attach);
    }

    #[test]
    fn test_detach_handshake() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.attach(None, true);
        channel.on_frame(attached("room", 0));

        let (tx, mut rx) = oneshot::channel();
        let frame = channel.detach(Some(tx), true).unwrap();
        assert_eq!(frame.action, Action::Detach);

        let detached = ProtocolMessage {
            channel: Some("room".into()),
            ..ProtocolMessage::new(Action::Detached)
        };
        assert!(channel.on_frame(detached).is_none());
        assert_eq!(channel.state(), ChannelState::Detached);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_unsolicited_detached_reattaches() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.attach(None, true);
        channel.on_frame(attached("room", 0));

        let detached = ProtocolMessage {
            channel: Some("room".into()),
            ..ProtocolMessage::new(Action::Detached)
        };
        let reply = channel.on_frame(detached).unwrap();
        assert_eq!(reply.action, Action::Attach);
        assert_eq!(channel.state(), ChannelState::Attaching);
    }

    #[test]
    fn test_messages_fan_out_with_defaults() {
        let mut channel = Channel::new("room", ChannelHub::default());
        let mut rx = channel.hub().messages.subscribe();

        let frame = ProtocolMessage {
            id: Some("abc:0".into()),
            connection_id: Some("conn-9".into()),
            timestamp: Some(1234),
            ..ProtocolMessage::message("room", vec![Message::new("a", json!(1)), Message::new("b", json!(2))])
        };
        channel.on_frame(frame);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.id.as_deref(), Some("abc:0:0"));
        assert_eq!(first.connection_id.as_deref(), Some("conn-9"));
        assert_eq!(first.timestamp, Some(1234));
        assert_eq!(rx.try_recv().unwrap().name.as_deref(), Some("b"));
    }

    #[test]
    fn test_presence_updates_report_applied() {
        let mut channel = Channel::new("room", ChannelHub::default());
        let mut rx = channel.hub().presence.subscribe();

        channel.on_frame(presence("room", PresenceAction::Enter, "alice", 100));
        channel.on_frame(presence("room", PresenceAction::Leave, "alice", 50));

        assert!(rx.try_recv().unwrap().applied);
        assert!(!rx.try_recv().unwrap().applied);
        assert_eq!(channel.presence().len(), 1);
    }

    #[test]
    fn test_sync_removes_unseen_members() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.on_frame(presence("room", PresenceAction::Enter, "alice", 1));
        channel.on_frame(presence("room", PresenceAction::Enter, "bob", 1));

        let sync = ProtocolMessage {
            action: Action::Sync,
            channel_serial: Some("seq1:".into()),
            ..presence("room", PresenceAction::Present, "alice", 2)
        };
        channel.on_frame(sync);

        assert_eq!(channel.presence().len(), 1);
        assert!(channel.presence().get("alice:c1").is_some());
    }

    #[test]
    fn test_sync_waits_for_final_cursor() {
        let mut channel = Channel::new("room", ChannelHub::default());
        let sync = ProtocolMessage {
            action: Action::Sync,
            channel_serial: Some("seq1:cursor".into()),
            ..presence("room", PresenceAction::Present, "alice", 2)
        };
        channel.on_frame(sync);
        assert!(channel.presence().sync_in_progress());
    }

    #[test]
    fn test_suspension_synthesizes_leaves() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.attach(None, true);
        channel.on_frame(attached("room", flags::HAS_PRESENCE));
        channel.on_frame(presence("room", PresenceAction::Enter, "alice", 100));
        let mut rx = channel.hub().presence.subscribe();

        channel.on_connection_interrupted(ConnectionState::Suspended, &ErrorInfo::suspended());

        assert_eq!(channel.state(), ChannelState::Suspended);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.member.action, PresenceAction::Leave);
        assert!(update.applied);
        assert!(channel.presence().is_empty());

        let frame = channel.on_connected(true).unwrap();
        assert_eq!(frame.action, Action::Attach);
    }

    #[test]
    fn test_members_ahead_of_local_clock_still_leave() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.attach(None, true);
        channel.on_frame(attached("room", flags::HAS_PRESENCE));
        channel.on_frame(presence("room", PresenceAction::Enter, "bob", now_millis() + 60_000));
        let mut rx = channel.hub().presence.subscribe();

        channel.on_connection_interrupted(ConnectionState::Suspended, &ErrorInfo::suspended());

        let update = rx.try_recv().unwrap();
        assert_eq!(update.member.client_id, "bob");
        assert_eq!(update.member.action, PresenceAction::Leave);
        assert!(update.applied);
        assert!(rx.try_recv().is_err());
        assert!(channel.presence().is_empty());
    }

    #[test]
    fn test_failed_connection_fails_waiters() {
        let mut channel = Channel::new("room", ChannelHub::default());
        let (tx, mut rx) = oneshot::channel();
        channel.attach(Some(tx), false);

        channel.on_connection_interrupted(ConnectionState::Failed, &ErrorInfo::failed());
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(rx.try_recv().unwrap(), Err(ErrorInfo::failed()));
        assert!(channel.check_publish().is_err());
    }

    #[test]
    fn test_channel_error_fails_channel() {
        let mut channel = Channel::new("room", ChannelHub::default());
        channel.attach(None, true);
        let frame = ProtocolMessage {
            channel: Some("room".into()),
            ..ProtocolMessage::error(ErrorInfo::new(40160, 401, "Not permitted"))
        };
        channel.on_frame(frame);
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(channel.error_reason().unwrap().code, 40160);
    }
}
