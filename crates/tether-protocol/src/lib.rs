//! # tether-protocol
//!
//! Wire protocol definitions for the Tether realtime client.
//!
//! This crate defines the frames exchanged with the realtime service, the
//! error values the service reports, and the JSON / MessagePack codec.
//!
//! ## Frame Actions
//!
//! - `Connect` / `Connected` / `Disconnected` / `Close` / `Closed` - Connection lifecycle
//! - `Attach` / `Attached` / `Detach` / `Detached` - Channel membership
//! - `Message` / `Presence` / `Sync` - Channel traffic
//! - `Ack` / `Nack` / `Error` / `Heartbeat` - Acknowledgments, errors and liveness
//! - `Auth` - Token renewal on a live connection
//!
//! Action codes follow the service's numbering, where `Ack` and `Nack` are
//! 1 and 2 rather than following `Sync`.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use tether_protocol::{codec, Format, Message, ProtocolMessage};
//!
//! let frame = ProtocolMessage::message("chat:lobby", vec![Message::new("greet", json!("hello"))]);
//!
//! let encoded = codec::encode(&frame, Format::MsgPack).unwrap();
//! let decoded = codec::decode(&encoded, Format::MsgPack).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod error_info;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_batch, encode, encode_batch, Format, ProtocolError};
pub use error_info::{codes, ErrorInfo};
pub use frames::{
    flags, Action, AuthDetails, ConnectionDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};
pub use version::{agent, Version, PROTOCOL_VERSION};
