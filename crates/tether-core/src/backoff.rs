//! Reconnect delays for the disconnected state.
//!
//! The delay grows by `factor` per failed attempt up to a cap, then a random
//! share of up to `jitter` is taken off so that clients dropped together do
//! not come back together.

use rand::Rng;
use std::time::Duration;

use crate::error::ClientError;
use crate::options::RetryOptions;

/// Reconnect delay schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    /// Schedule from retry options, never waiting longer than `cap`.
    #[must_use]
    pub fn new(retry: &RetryOptions, cap: Duration) -> Self {
        Self {
            initial: Duration::from_millis(retry.initial_delay_ms),
            cap: Duration::from_millis(retry.max_delay_ms).min(cap),
            factor: retry.factor,
            jitter: retry.jitter,
        }
    }

    /// The same schedule without randomness.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        Self { jitter: 0.0, ..self }
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidOptions`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ClientError> {
        let problem = if self.initial.is_zero() {
            "retry.initial_delay_ms must be > 0"
        } else if self.cap < self.initial {
            "retry.max_delay_ms and the disconnected retry timeout must be >= retry.initial_delay_ms"
        } else if !self.factor.is_finite() || self.factor < 1.0 {
            "retry.factor must be >= 1.0"
        } else if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            "retry.jitter must be between 0.0 and 1.0"
        } else {
            return Ok(());
        };
        Err(ClientError::InvalidOptions(problem.to_string()))
    }

    /// Delay before the retry that follows `failures` consecutive failed
    /// attempts (at least one).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let steps = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap = self.cap.as_secs_f64();
        let base = Duration::from_secs_f64(
            (self.initial.as_secs_f64() * self.factor.powi(steps)).min(cap),
        );
        if self.jitter == 0.0 {
            return base;
        }
        let coefficient = 1.0 - rand::rng().random_range(0.0..=self.jitter);
        base.mul_f64(coefficient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&RetryOptions::default(), Duration::from_secs(15))
    }

    #[test]
    fn test_grows_then_caps() {
        let backoff = backoff().without_jitter();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(11), Duration::from_secs(15));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_only_shortens() {
        let backoff = backoff();
        for failures in 1..7 {
            let base = backoff.without_jitter().delay(failures);
            let delay = backoff.delay(failures);
            assert!(delay <= base);
            assert!(delay >= base.mul_f64(0.8));
        }
    }

    #[test]
    fn test_cap_from_retry_timeout() {
        let backoff = Backoff::new(&RetryOptions::default(), Duration::from_secs(2)).without_jitter();
        assert_eq!(backoff.delay(5), Duration::from_secs(2));
    }

    #[test]
    fn test_validate() {
        assert!(backoff().validate().is_ok());
        let retry = RetryOptions {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(Backoff::new(&retry, Duration::from_secs(15)).validate().is_err());
        assert!(Backoff::new(&RetryOptions::default(), Duration::from_millis(10))
            .validate()
            .is_err());
    }
}
