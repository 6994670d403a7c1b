//! Recovery keys.
//!
//! A recovery key lets a new client instance take over the connection of a
//! previous one, including the serial its next publish should carry. The
//! `recover` option also accepts a bare connection key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    pub connection_key: String,
    #[serde(default)]
    pub msg_serial: u64,
}

impl RecoveryKey {
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Read a `recover` option value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        serde_json::from_str(value).unwrap_or_else(|_| Self {
            connection_key: value.to_string(),
            msg_serial: 0,
        })
    }
}
