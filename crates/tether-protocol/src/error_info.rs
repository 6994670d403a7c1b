//! Service error values.
//!
//! [`ErrorInfo`] is what the service sends in ERROR, NACK and DISCONNECTED
//! frames, and what the client reports on state changes and failed
//! publishes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known error codes.
pub mod codes {
    pub const FAILED: u32 = 80000;
    pub const SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const UNABLE_TO_RECOVER: u32 = 80008;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const UNKNOWN_CHANNEL: u32 = 50001;
    pub const UNKNOWN_CONNECTION: u32 = 50002;
    pub const TIMEOUT: u32 = 50003;
    pub const REJECTED: u32 = 90000;
    pub const CHANNEL_FAILED: u32 = 90001;
    pub const TOKEN_ERROR_START: u32 = 40140;
    pub const TOKEN_ERROR_END: u32 = 40150;
    pub const NO_CREDENTIALS: u32 = 40106;
}

const CONNECTION_CODES: [u32; 6] = [
    codes::DISCONNECTED,
    codes::SUSPENDED,
    codes::FAILED,
    codes::CONNECTION_CLOSED,
    codes::UNKNOWN_CONNECTION,
    codes::UNKNOWN_CHANNEL,
];

/// An error reported by, or on behalf of, the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Create an error.
    #[must_use]
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(
            codes::DISCONNECTED,
            400,
            "Connection to server temporarily unavailable",
        )
    }

    #[must_use]
    pub fn suspended() -> Self {
        Self::new(codes::SUSPENDED, 400, "Connection to server unavailable")
    }

    #[must_use]
    pub fn failed() -> Self {
        Self::new(
            codes::FAILED,
            400,
            "Connection failed or disconnected by server",
        )
    }

    #[must_use]
    pub fn closing() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "Connection closing")
    }

    #[must_use]
    pub fn closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "Connection closed")
    }

    #[must_use]
    pub fn unknown_connection() -> Self {
        Self::new(codes::UNKNOWN_CONNECTION, 500, "Internal connection error")
    }

    /// Default reason attached to a NACK that carries none.
    #[must_use]
    pub fn nack_default() -> Self {
        Self::new(
            codes::UNKNOWN_CHANNEL,
            500,
            "Unable to send message; channel not responding",
        )
    }

    /// Reported for in-flight publishes when a resume is rejected.
    #[must_use]
    pub fn unable_to_recover() -> Self {
        Self::new(
            codes::UNABLE_TO_RECOVER,
            400,
            "Unable to recover connection; in-flight messages may not have been delivered",
        )
    }

    #[must_use]
    pub fn timeout(what: &str) -> Self {
        Self::new(codes::TIMEOUT, 504, format!("{what} timed out"))
    }

    /// Whether the code is in the token error range.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_START..codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// Whether trying another host or transport may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        if self.status_code == 0 || self.code == 0 || self.status_code >= 500 {
            return true;
        }
        CONNECTION_CODES.contains(&self.code)
    }

    /// Whether the service will never accept this connection as configured.
    ///
    /// Client errors (40000..50000) other than token errors, plus the
    /// connection codes no retry can resolve.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        const UNRESOLVABLE: [u32; 3] = [80015, codes::CONNECTION_CLOSED, 80030];
        self.code != 0
            && !self.is_token_error()
            && (UNRESOLVABLE.contains(&self.code) || (40000..50000).contains(&self.code))
    }
}
