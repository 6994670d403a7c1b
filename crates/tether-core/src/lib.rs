//! # tether-core
//!
//! Connection management, channels and presence for the Tether realtime client.
//!
//! This crate provides:
//!
//! - **State** - The connection state machine
//! - **Manager** - Transport lifecycle, fallback, retry and resume
//! - **Queue** - Outbound messages awaiting a connection or an ACK
//! - **Channel** - Attach/detach handshake and inbound routing
//! - **Presence** - Newest-wins membership map
//! - **Client** - The [`Realtime`] and [`RealtimeChannel`] handles
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands  ┌─────────────────────┐  frames  ┌─────────────┐
//! │  Realtime   │───────────▶│  ConnectionManager  │─────────▶│  Transport  │
//! └─────────────┘            └─────────────────────┘◀─────────└─────────────┘
//!                                │            │        events
//!                                ▼            ▼
//!                         ┌─────────────┐ ┌─────────────┐
//!                         │  Channels   │ │  Presence   │
//!                         └─────────────┘ └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_core::{ClientOptions, Realtime};
//!
//! # async fn example() -> Result<(), tether_core::ClientError> {
//! let client = Realtime::new(ClientOptions::with_key("app.key:secret"))?;
//! let channel = client.channel("updates")?;
//! channel.attach().await?;
//! channel.publish("greeting", json!({"text": "hello"})).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod client;
pub mod encoder;
pub mod error;
pub mod manager;
pub mod options;
pub mod presence;
pub mod queue;
pub mod recovery;
pub mod router;
pub mod state;

pub use backoff::Backoff;
pub use channel::{
    validate_channel_name, Channel, ChannelHub, ChannelState, ChannelStateChange, PresenceUpdate,
    MAX_CHANNEL_NAME_LENGTH,
};
pub use client::{Realtime, RealtimeChannel};
pub use encoder::{IdentityEncoder, JsonEncoder, PayloadEncoder};
pub use error::ClientError;
pub use manager::{ConnectionManager, ConnectionSnapshot, PingCompletion};
pub use options::{ClientOptions, RetryOptions, TimeoutOptions};
pub use presence::PresenceMap;
pub use queue::{Completion, MessageQueue, PendingMessage};
pub use recovery::RecoveryKey;
pub use router::Channels;
pub use state::{transition, ConnectionState, ConnectionStateChange, StateEvent};

pub use tether_protocol::{ErrorInfo, Message, PresenceAction, PresenceMessage};
