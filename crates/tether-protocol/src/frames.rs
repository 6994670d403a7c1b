//! Frame types for the Tether protocol.
//!
//! A [`ProtocolMessage`] is the single unit exchanged with the service. Its
//! [`Action`] decides which of the optional fields are meaningful. Both the
//! JSON and the MessagePack encodings use the same camelCase field names.

use serde::{Deserialize, Serialize};

use crate::error_info::ErrorInfo;

/// Protocol action codes.
///
/// The numbering is the one the service speaks: ACK and NACK are 1 and 2,
/// directly after HEARTBEAT, and SYNC and AUTH close the list at 16 and 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(Action::Heartbeat),
            1 => Ok(Action::Ack),
            2 => Ok(Action::Nack),
            3 => Ok(Action::Connect),
            4 => Ok(Action::Connected),
            5 => Ok(Action::Disconnect),
            6 => Ok(Action::Disconnected),
            7 => Ok(Action::Close),
            8 => Ok(Action::Closed),
            9 => Ok(Action::Error),
            10 => Ok(Action::Attach),
            11 => Ok(Action::Attached),
            12 => Ok(Action::Detach),
            13 => Ok(Action::Detached),
            14 => Ok(Action::Presence),
            15 => Ok(Action::Message),
            16 => Ok(Action::Sync),
            17 => Ok(Action::Auth),
            _ => Err("Invalid action"),
        }
    }
}

impl Action {
    /// Whether a frame with this action expects an ACK or NACK from the service.
    #[must_use]
    pub fn ack_required(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Heartbeat => "heartbeat",
            Action::Ack => "ack",
            Action::Nack => "nack",
            Action::Connect => "connect",
            Action::Connected => "connected",
            Action::Disconnect => "disconnect",
            Action::Disconnected => "disconnected",
            Action::Close => "close",
            Action::Closed => "closed",
            Action::Error => "error",
            Action::Attach => "attach",
            Action::Attached => "attached",
            Action::Detach => "detach",
            Action::Detached => "detached",
            Action::Presence => "presence",
            Action::Message => "message",
            Action::Sync => "sync",
            Action::Auth => "auth",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bit flags carried in [`ProtocolMessage::flags`].
pub mod flags {
    /// The channel has presence members; a SYNC follows.
    pub const HAS_PRESENCE: u32 = 1 << 0;
    /// The service will replay a message backlog after attach.
    pub const HAS_BACKLOG: u32 = 1 << 1;
    /// The attach continued a previous attachment without loss.
    pub const RESUMED: u32 = 1 << 2;
}

/// Presence action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// Witness of a removal made during a sync.
    Absent = 0,
    /// Member is present (sync entries and normalized enter/update).
    Present = 1,
    /// Member entered the channel.
    Enter = 2,
    /// Member left the channel.
    Leave = 3,
    /// Member updated their presence data.
    Update = 4,
}

impl From<PresenceAction> for u8 {
    fn from(pa: PresenceAction) -> u8 {
        pa as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            _ => Err("Invalid presence action"),
        }
    }
}

/// A channel message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Service timestamp in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Payload encoding chain, e.g. `"json/base64"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Message {
    /// Create a named message with a payload.
    #[must_use]
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Rough serialized size used to bound bundled frames.
    #[must_use]
    pub fn size(&self) -> usize {
        let data = match &self.data {
            None => 0,
            Some(serde_json::Value::String(s)) => s.len(),
            Some(other) => other.to_string().len(),
        };
        data + self.name.as_deref().map_or(0, str::len)
            + self.client_id.as_deref().map_or(0, str::len)
    }
}

/// A presence event for one member of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl PresenceMessage {
    /// Create a presence event.
    #[must_use]
    pub fn new(
        action: PresenceAction,
        client_id: impl Into<String>,
        connection_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            action,
            id: None,
            client_id: client_id.into(),
            connection_id: connection_id.into(),
            timestamp,
            data: None,
            encoding: None,
        }
    }

    /// Attach presence data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Key identifying the member: `client_id:connection_id`.
    #[must_use]
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.client_id, self.connection_id)
    }

    /// A synthesized event was not published by the member's own connection,
    /// so its id cannot be ordered against the member's real events.
    #[must_use]
    pub fn is_synthesized(&self) -> bool {
        match &self.id {
            Some(id) => !id.starts_with(&self.connection_id),
            None => true,
        }
    }
}

/// Connection parameters sent by the service with CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// Longest silence the service guarantees between frames, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    /// How long the service keeps connection state for resume, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Credentials presented in an AUTH frame to renew a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    /// Number of messages covered by an ACK or NACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    /// Create an empty frame with the given action.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            flags: None,
            count: None,
            error: None,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            msg_serial: None,
            timestamp: None,
            messages: None,
            presence: None,
            connection_details: None,
            auth: None,
        }
    }

    /// Create a MESSAGE frame for a channel.
    #[must_use]
    pub fn message(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            channel: Some(channel.into()),
            messages: Some(messages),
            ..Self::new(Action::Message)
        }
    }

    /// Create a PRESENCE frame for a channel.
    #[must_use]
    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        Self {
            channel: Some(channel.into()),
            presence: Some(presence),
            ..Self::new(Action::Presence)
        }
    }

    /// Create an ATTACH frame.
    #[must_use]
    pub fn attach(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(Action::Attach)
        }
    }

    /// Create a DETACH frame.
    #[must_use]
    pub fn detach(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(Action::Detach)
        }
    }

    /// Create a HEARTBEAT frame carrying a ping id.
    #[must_use]
    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(Action::Heartbeat)
        }
    }

    /// Create a CLOSE frame.
    #[must_use]
    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    /// Create an AUTH frame carrying a renewed token.
    #[must_use]
    pub fn auth(access_token: impl Into<String>) -> Self {
        Self {
            auth: Some(AuthDetails {
                access_token: access_token.into(),
            }),
            ..Self::new(Action::Auth)
        }
    }

    /// Create an ACK frame.
    #[must_use]
    pub fn ack(msg_serial: u64, count: u64) -> Self {
        Self {
            msg_serial: Some(msg_serial),
            count: Some(count),
            ..Self::new(Action::Ack)
        }
    }

    /// Create a NACK frame.
    #[must_use]
    pub fn nack(msg_serial: u64, count: u64, error: Option<ErrorInfo>) -> Self {
        Self {
            msg_serial: Some(msg_serial),
            count: Some(count),
            error,
            ..Self::new(Action::Nack)
        }
    }

    /// Create a CONNECTED frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, details: ConnectionDetails) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            connection_details: Some(details),
            ..Self::new(Action::Connected)
        }
    }

    /// Create an ERROR frame.
    #[must_use]
    pub fn error(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Action::Error)
        }
    }

    /// Whether the given bit from [`flags`] is set.
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Whether the frame expects an ACK or NACK.
    #[must_use]
    pub fn ack_required(&self) -> bool {
        self.action.ack_required()
    }

    /// Connection-level frames carry no channel.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        self.channel.is_none()
    }

    /// Number of messages or presence events carried.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.messages.as_ref().map_or(0, Vec::len) + self.presence.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_conversion() {
        assert_eq!(Action::try_from(1), Ok(Action::Ack));
        assert_eq!(Action::try_from(2), Ok(Action::Nack));
        assert_eq!(Action::try_from(15), Ok(Action::Message));
        assert!(Action::try_from(42).is_err());
        assert_eq!(u8::from(Action::Sync), 16);
    }

    #[test]
    fn test_presence_action_conversion() {
        assert_eq!(PresenceAction::try_from(0), Ok(PresenceAction::Absent));
        assert_eq!(PresenceAction::try_from(3), Ok(PresenceAction::Leave));
        assert!(PresenceAction::try_from(5).is_err());
    }

    #[test]
    fn test_ack_required() {
        assert!(ProtocolMessage::message("room", vec![]).ack_required());
        assert!(ProtocolMessage::presence("room", vec![]).ack_required());
        assert!(!ProtocolMessage::attach("room").ack_required());
        assert!(!ProtocolMessage::heartbeat("p1").ack_required());
    }

    #[test]
    fn test_json_field_names() {
        let mut frame = ProtocolMessage::message("chat", vec![Message::new("greet", json!("hi"))]);
        frame.msg_serial = Some(3);
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["action"], json!(15));
        assert_eq!(value["msgSerial"], json!(3));
        assert_eq!(value["messages"][0]["name"], json!("greet"));
        assert!(value.get("connectionId").is_none());
    }

    #[test]
    fn test_auth_frame() {
        let value = serde_json::to_value(ProtocolMessage::auth("tok-2")).unwrap();
        assert_eq!(value, json!({"action": 17, "auth": {"accessToken": "tok-2"}}));
    }

    #[test]
    fn test_flags() {
        let mut frame = ProtocolMessage::new(Action::Attached);
        frame.flags = Some(flags::HAS_PRESENCE | flags::RESUMED);
        assert!(frame.has_flag(flags::HAS_PRESENCE));
        assert!(frame.has_flag(flags::RESUMED));
        assert!(!frame.has_flag(flags::HAS_BACKLOG));
    }

    #[test]
    fn test_member_key_and_synthesized() {
        let mut member = PresenceMessage::new(PresenceAction::Enter, "alice", "conn1", 100);
        assert_eq!(member.member_key(), "alice:conn1");
        assert!(member.is_synthesized());

        member.id = Some("conn1:0:0".into());
        assert!(!member.is_synthesized());

        member.id = Some("other:0:0".into());
        assert!(member.is_synthesized());
    }
}
