//! Channel registry and inbound frame routing.

use std::collections::HashMap;
use tether_protocol::{ErrorInfo, ProtocolMessage};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelHub};
use crate::state::ConnectionState;

/// All channels of one connection, indexed by name.
#[derive(Debug, Default)]
pub struct Channels {
    channels: HashMap<String, Channel>,
}

impl Channels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel with the hub its handles listen on.
    ///
    /// An existing channel keeps its state and switches to the new hub.
    pub fn register(&mut self, name: &str, hub: ChannelHub) -> &mut Channel {
        let channel = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = %name, "Creating channel");
                Channel::new(name, hub.clone())
            });
        channel.set_hub(hub);
        channel
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Channel {
        self.channels.entry(name.to_string()).or_insert_with(|| {
            debug!(channel = %name, "Creating channel");
            Channel::new(name, ChannelHub::default())
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Hand a channel-scoped frame to its channel.
    ///
    /// Returns the reply the channel wants sent, if any. Frames for unknown
    /// channels are dropped.
    pub fn route(&mut self, frame: ProtocolMessage) -> Option<ProtocolMessage> {
        let name = frame.channel.clone()?;
        match self.channels.get_mut(&name) {
            Some(channel) => channel.on_frame(frame),
            None => {
                warn!(channel = %name, action = %frame.action, "Frame for unknown channel");
                None
            }
        }
    }

    /// Frames every channel needs sent after the connection came up.
    pub fn on_connected(&mut self, resumed: bool) -> Vec<ProtocolMessage> {
        self.channels
            .values_mut()
            .filter_map(|c| c.on_connected(resumed))
            .collect()
    }

    pub fn on_connection_interrupted(&mut self, state: ConnectionState, reason: &ErrorInfo) {
        for channel in self.channels.values_mut() {
            channel.on_connection_interrupted(state, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use tether_protocol::Action;

    #[test]
    fn test_route_to_known_channel() {
        let mut channels = Channels::new();
        channels.get_or_create("room").attach(None, true);

        let attached = ProtocolMessage {
            channel: Some("room".into()),
            ..ProtocolMessage::new(Action::Attached)
        };
        assert!(channels.route(attached).is_none());
        assert_eq!(channels.get("room").unwrap().state(), ChannelState::Attached);
    }

    #[test]
    fn test_unknown_channel_dropped() {
        let mut channels = Channels::new();
        let frame = ProtocolMessage::attach("nowhere");
        assert!(channels.route(frame).is_none());
        assert!(channels.is_empty());
    }

    #[test]
    fn test_reconnect_reattaches() {
        let mut channels = Channels::new();
        channels.get_or_create("a").attach(None, false);
        channels.get_or_create("b");

        let frames = channels.on_connected(false);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel.as_deref(), Some("a"));
    }

    #[test]
    fn test_register_keeps_state() {
        let mut channels = Channels::new();
        channels.get_or_create("room").attach(None, false);
        let hub = ChannelHub::default();
        let mut rx = hub.states.subscribe();
        channels.register("room", hub);

        assert_eq!(channels.get("room").unwrap().state(), ChannelState::Attaching);
        channels.on_connection_interrupted(ConnectionState::Closed, &ErrorInfo::closed());
        assert_eq!(rx.try_recv().unwrap().current, ChannelState::Detached);
    }
}
