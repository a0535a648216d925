//! Retry policy for wireless handshake attempts.
//!
//! A failed handshake attempt is re-run over the same physical link until
//! the policy's attempt budget is spent. The retry counter after the n-th
//! failure is n; another attempt is made while it stays below
//! [`RetryPolicy::max_attempts`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use locker_core::RetryPolicy;
//!
//! // Three attempts, no pause between them
//! let policy = RetryPolicy::default();
//! assert!(policy.should_retry(1));
//! assert!(!policy.should_retry(3));
//!
//! // Pause between attempts for noisy environments
//! let patient = RetryPolicy::new(5).initial_delay(Duration::from_millis(500));
//! assert_eq!(patient.max_attempts, 5);
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Configuration for wireless retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of wireless attempts, the first one included.
    pub max_attempts: u32,
    /// Pause before the first retry. Zero retries right away.
    pub initial_delay: Duration,
    /// Maximum pause between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` wireless attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Patient retries for lockers in noisy RF environments.
    pub fn patient() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the total number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Whether another attempt is allowed once the retry counter has
    /// reached `retry`.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_attempts
    }

    /// Pause before the attempt numbered `retry` (1 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = retry.saturating_sub(1) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Reject policies that can never make an attempt.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config(
                "backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Whether an attempt failure enters the wireless retry policy.
///
/// Stage errors and key service failures end the attempt and are retried.
/// Discovery, network and location outcomes are final.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::ConnectFailed(_)
        | Error::ServiceNotFound(_)
        | Error::CharacteristicNotFound(_)
        | Error::ReadFailed(_)
        | Error::WriteFailed(_)
        | Error::LinkUnavailable => true,
        // Surfaced unmodified, but still only ends the current attempt
        Error::KeyCapabilityFailed(_) => true,
        // Could not start a transport operation; often transient
        Error::Bluetooth(_) => true,
        Error::DeviceNotFound(_)
        | Error::NetworkFailed(_)
        | Error::LocationUnavailable(_)
        | Error::LocationPermissionDenied
        | Error::Busy
        | Error::MissingToken(_)
        | Error::InvalidConfig(_)
        | Error::SessionAborted => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageFailure;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(!policy.jitter);
        assert_eq!(policy.delay_for_retry(1), Duration::ZERO);
    }

    #[test]
    fn test_should_retry_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let none = RetryPolicy::none();
        assert!(!none.should_retry(1));
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::default()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::default()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default()
            .initial_delay(Duration::from_millis(400))
            .jitter(true);
        for _ in 0..50 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::patient().validate().is_ok());
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(
            RetryPolicy::default()
                .backoff_multiplier(0.5)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&Error::WriteFailed(StageFailure::Transport(
            "GATT error".into()
        ))));
        assert!(is_retryable(&Error::LinkUnavailable));
        assert!(is_retryable(&Error::key_failed("server unavailable")));
        assert!(!is_retryable(&Error::device_not_found("locker-1")));
        assert!(!is_retryable(&Error::network_failed("503")));
        assert!(!is_retryable(&Error::LocationPermissionDenied));
    }
}
