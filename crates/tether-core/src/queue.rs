//! Outbound message queue.
//!
//! A [`PendingMessage`] is one outbound frame plus everyone waiting on its
//! outcome. The connection manager keeps two [`MessageQueue`]s: one for
//! messages not yet handed to a transport, and one for messages sent and
//! awaiting an ACK or NACK.

use std::collections::VecDeque;
use tether_protocol::{Action, ErrorInfo, ProtocolMessage};
use tokio::sync::oneshot;
use tracing::trace;

/// Receives the outcome of one publish.
pub type Completion = oneshot::Sender<Result<(), ErrorInfo>>;

/// An outbound frame awaiting an outcome.
#[derive(Debug)]
pub struct PendingMessage {
    pub message: ProtocolMessage,
    completions: Vec<Completion>,
    /// Whether the frame has been handed to the current transport.
    pub send_attempted: bool,
    pub ack_required: bool,
}

impl PendingMessage {
    #[must_use]
    pub fn new(message: ProtocolMessage, completion: Option<Completion>) -> Self {
        let ack_required = message.ack_required();
        Self {
            message,
            completions: completion.into_iter().collect(),
            send_attempted: false,
            ack_required,
        }
    }

    /// Serial assigned when the frame was first sent.
    #[must_use]
    pub fn msg_serial(&self) -> Option<u64> {
        self.message.msg_serial
    }

    /// Deliver the outcome to every waiter.
    pub fn complete(self, result: Result<(), ErrorInfo>) {
        for completion in self.completions {
            let _ = completion.send(result.clone());
        }
    }

    fn size(&self) -> usize {
        self.message
            .messages
            .iter()
            .flatten()
            .map(tether_protocol::Message::size)
            .sum::<usize>()
            + self
                .message
                .presence
                .iter()
                .flatten()
                .map(|p| p.data.as_ref().map_or(0, |d| d.to_string().len()) + p.client_id.len())
                .sum::<usize>()
    }

    /// Whether `other` may travel in the same frame as this entry.
    fn can_bundle(&self, other: &PendingMessage, max_size: usize) -> bool {
        let (a, b) = (&self.message, &other.message);
        if self.send_attempted || a.msg_serial.is_some() {
            return false;
        }
        if a.action != b.action || a.channel != b.channel {
            return false;
        }
        if !matches!(a.action, Action::Message | Action::Presence) {
            return false;
        }
        if self.size() + other.size() > max_size {
            return false;
        }
        match a.action {
            Action::Message => {
                let messages = a.messages.iter().flatten().chain(b.messages.iter().flatten());
                let mut client_ids = messages.clone().map(|m| m.client_id.as_deref());
                let first = client_ids.next().flatten();
                client_ids.all(|id| id == first) && messages.clone().all(|m| m.id.is_none())
            }
            _ => {
                let presence = a.presence.iter().flatten().chain(b.presence.iter().flatten());
                presence.clone().all(|p| p.id.is_none())
            }
        }
    }

    fn absorb(&mut self, other: PendingMessage) {
        if let Some(messages) = other.message.messages {
            self.message.messages.get_or_insert_with(Vec::new).extend(messages);
        }
        if let Some(presence) = other.message.presence {
            self.message.presence.get_or_insert_with(Vec::new).extend(presence);
        }
        self.completions.extend(other.completions);
    }
}

/// Ordered queue of pending messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<PendingMessage>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: PendingMessage) {
        self.messages.push_back(message);
    }

    /// Queue a message, merging it into the last entry when possible.
    ///
    /// Returns `true` if the message was bundled.
    pub fn push_bundled(&mut self, message: PendingMessage, max_size: usize) -> bool {
        if let Some(last) = self.messages.back_mut() {
            if last.can_bundle(&message, max_size) {
                trace!(channel = ?message.message.channel, "Bundling queued message");
                last.absorb(message);
                return true;
            }
        }
        self.messages.push_back(message);
        false
    }

    pub fn shift(&mut self) -> Option<PendingMessage> {
        self.messages.pop_front()
    }

    /// Put `other` in front of everything in this queue, keeping its order.
    pub fn prepend(&mut self, mut other: MessageQueue) {
        other.messages.append(&mut self.messages);
        self.messages = other.messages;
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.messages.iter()
    }

    /// Complete every entry with a serial below `serial + count`.
    ///
    /// Entries are completed in queue order; returns how many were completed.
    pub fn complete_messages(
        &mut self,
        serial: u64,
        count: u64,
        err: Option<ErrorInfo>,
    ) -> usize {
        trace!(serial, count, "Completing messages");
        let end = serial.saturating_add(count);
        let mut completed = 0;
        while let Some(first) = self.messages.front() {
            match first.msg_serial() {
                Some(s) if s < end => {}
                _ => break,
            }
            if let Some(message) = self.messages.pop_front() {
                message.complete(err.clone().map_or(Ok(()), Err));
                completed += 1;
            }
        }
        completed
    }

    /// Complete every entry that already carries a serial with `err`.
    ///
    /// Used when the service cannot know about earlier sends; entries never
    /// sent stay queued. Returns how many were completed.
    pub fn complete_serialled(&mut self, err: &ErrorInfo) -> usize {
        let (serialled, rest): (VecDeque<_>, VecDeque<_>) = self
            .messages
            .drain(..)
            .partition(|m| m.msg_serial().is_some());
        self.messages = rest;
        let count = serialled.len();
        for message in serialled {
            message.complete(Err(err.clone()));
        }
        count
    }

    /// Complete every entry with `err`.
    pub fn complete_all(&mut self, err: &ErrorInfo) {
        for message in self.messages.drain(..) {
            message.complete(Err(err.clone()));
        }
    }

    /// Mark every entry as not yet sent on the current transport.
    pub fn reset_send_attempted(&mut self) {
        for message in &mut self.messages {
            message.send_attempted = false;
        }
    }

    pub fn take_all(&mut self) -> MessageQueue {
        std::mem::take(self)
    }
}
