//! Connection state machine.
//!
//! [`transition`] is a pure function over [`ConnectionState`] and
//! [`StateEvent`]. The connection manager performs the side effects that go
//! with each state; this module only decides where an event leads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tether_protocol::ErrorInfo;

/// State of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Messages published in this state are held until connected.
    #[must_use]
    pub fn queue_events(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }

    /// Messages published in this state go straight to the transport.
    #[must_use]
    pub fn send_events(self) -> bool {
        self == ConnectionState::Connected
    }

    /// No automatic reconnection leaves this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Reason reported for publishes failed in this state.
    #[must_use]
    pub fn default_error(self) -> ErrorInfo {
        match self {
            ConnectionState::Suspended => ErrorInfo::suspended(),
            ConnectionState::Closing => ErrorInfo::closing(),
            ConnectionState::Closed => ErrorInfo::closed(),
            ConnectionState::Failed => ErrorInfo::failed(),
            ConnectionState::Disconnected => ErrorInfo::disconnected(),
            _ => ErrorInfo::unknown_connection(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectRequested,
    CloseRequested,
    /// The service confirmed a connection on some transport.
    TransportConnected,
    /// A transport was lost, or a connection attempt failed transiently.
    TransportLost,
    /// The retry budget or the host list ran out.
    AttemptsExhausted,
    /// The connection state TTL elapsed without a connection.
    SuspendTimeout,
    /// The retry timer for disconnected or suspended fired.
    RetryTimeout,
    CloseConfirmed,
    /// The service refused the connection for good.
    Fatal,
}

/// Next state for `event` in `state`.
///
/// `None` means the event cannot be handled now and should be replayed
/// after the next state change. `Some(state)` equal to the input means the
/// event is ignored.
#[must_use]
pub fn transition(state: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState as S;
    use StateEvent as E;

    let next = match (state, event) {
        (S::Closing, E::ConnectRequested) => return None,
        (S::Connecting | S::Connected, E::ConnectRequested) => state,
        (_, E::ConnectRequested) => S::Connecting,

        (S::Connected, E::CloseRequested) => S::Closing,
        (S::Closing | S::Closed, E::CloseRequested) => state,
        (_, E::CloseRequested) => S::Closed,

        (S::Connecting | S::Connected, E::TransportConnected) => S::Connected,
        (S::Closing, E::TransportLost | E::CloseConfirmed) => S::Closed,
        (S::Connecting | S::Connected, E::TransportLost) => S::Disconnected,
        (S::Connecting | S::Connected | S::Disconnected, E::AttemptsExhausted) => S::Suspended,
        (S::Connecting | S::Disconnected, E::SuspendTimeout) => S::Suspended,
        (S::Disconnected | S::Suspended, E::RetryTimeout) => S::Connecting,

        (S::Closed | S::Failed, E::Fatal) => state,
        (_, E::Fatal) => S::Failed,

        _ => state,
    };
    Some(next)
}

/// A state change as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic attempt, for disconnected and suspended.
    pub retry_in: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState as S;
    use StateEvent as E;

    #[test]
    fn test_connect_from_idle_states() {
        for state in [S::Initialized, S::Disconnected, S::Suspended, S::Closed, S::Failed] {
            assert_eq!(transition(state, E::ConnectRequested), Some(S::Connecting));
        }
        assert_eq!(transition(S::Connected, E::ConnectRequested), Some(S::Connected));
        assert_eq!(transition(S::Connecting, E::ConnectRequested), Some(S::Connecting));
    }

    #[test]
    fn test_connect_while_closing_is_deferred() {
        assert_eq!(transition(S::Closing, E::ConnectRequested), None);
    }

    #[test]
    fn test_close() {
        assert_eq!(transition(S::Connected, E::CloseRequested), Some(S::Closing));
        assert_eq!(transition(S::Connecting, E::CloseRequested), Some(S::Closed));
        assert_eq!(transition(S::Suspended, E::CloseRequested), Some(S::Closed));
        assert_eq!(transition(S::Closing, E::CloseConfirmed), Some(S::Closed));
        assert_eq!(transition(S::Closing, E::TransportLost), Some(S::Closed));
    }

    #[test]
    fn test_failure_paths() {
        assert_eq!(transition(S::Connected, E::TransportLost), Some(S::Disconnected));
        assert_eq!(transition(S::Connecting, E::AttemptsExhausted), Some(S::Suspended));
        assert_eq!(transition(S::Disconnected, E::SuspendTimeout), Some(S::Suspended));
        assert_eq!(transition(S::Connecting, E::Fatal), Some(S::Failed));
        assert_eq!(transition(S::Connected, E::AttemptsExhausted), Some(S::Suspended));
        assert_eq!(transition(S::Connected, E::SuspendTimeout), Some(S::Connected));
        assert_eq!(transition(S::Suspended, E::TransportLost), Some(S::Suspended));
        assert_eq!(transition(S::Closed, E::Fatal), Some(S::Closed));
    }

    #[test]
    fn test_unrelated_events_ignored() {
        assert_eq!(transition(S::Closed, E::TransportConnected), Some(S::Closed));
        assert_eq!(transition(S::Connected, E::RetryTimeout), Some(S::Connected));
    }

    #[test]
    fn test_queue_and_send_flags() {
        assert!(S::Connecting.queue_events());
        assert!(S::Disconnected.queue_events());
        assert!(!S::Suspended.queue_events());
        assert!(S::Connected.send_events());
        assert!(!S::Closing.send_events());
    }
}
