//! Client API errors.

use tether_protocol::ErrorInfo;
use thiserror::Error;

/// Errors returned by [`Realtime`](crate::Realtime) and
/// [`RealtimeChannel`](crate::RealtimeChannel).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The service, or the connection on its behalf, reported an error.
    #[error(transparent)]
    Service(#[from] ErrorInfo),

    /// The client task is gone.
    #[error("Client has been dropped")]
    Dropped,

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Invalid client options.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

impl ClientError {
    /// Service error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            ClientError::Service(e) => Some(e.code),
            _ => None,
        }
    }
}
