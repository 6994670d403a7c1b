//! Per-request timeout and retry.
//!
//! This is independent of connection-level backoff: a Comet send that fails
//! once is retried here, and only when every attempt failed does the
//! transport give up and report a disconnect.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::http::HttpError;

/// Timeout and retry bounds for one logical HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub timeout: Duration,
    /// Attempts after the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl RequestPolicy {
    /// Same policy with a different timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `attempt` until it succeeds or the retries are used up.
    ///
    /// Each attempt is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T, HttpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let mut tries = 0u32;
        loop {
            let result = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(HttpError::Timeout),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if tries < self.max_retries => {
                    tries += 1;
                    debug!(request = what, attempt = tries, error = %err, "Retrying request");
                    tokio::time::sleep(self.retry_delay * tries).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
