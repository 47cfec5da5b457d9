//! Backoff policy for retried remote calls
//!
//! A [`RetryPolicy`] answers two questions: how many attempts an operation may
//! consume, and how long to wait before the next one. The same policy family is
//! used for call-level retries (one remote call) and chunk-level retries (one
//! batch chunk), so both tiers back off the same way.
//!
//! # Example
//!
//! ```
//! use erp_gateway_core_resilience::backoff::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(2),
//!     backoff: BackoffStrategy::Exponential,
//!     jitter_factor: 0.0,
//! };
//!
//! assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
//! assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
//! assert_eq!(policy.calculate_delay(10), Duration::from_secs(2));
//! ```

use crate::error::ResilienceError;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for the computed delay (jitter is added on top)
    pub max_delay: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0), only used by `ExponentialWithJitter`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Policy for flaky links: more attempts, shorter first delay
    pub fn network() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
        }
    }

    /// Chunk-level policy: a couple of extra rounds with longer pauses,
    /// meant to sit on top of a call-level policy
    pub fn chunk_default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }

    /// Single attempt, never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    /// Check the policy for values that would make retries meaningless
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::InvalidPolicy(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ResilienceError::InvalidPolicy(format!(
                "initial_delay ({:?}) exceeds max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Calculate the delay before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Fixed => self.initial_delay,
        };

        let capped_delay = base_delay.min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter)
            && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            capped_delay + Duration::from_secs_f64(capped_delay.as_secs_f64() * jitter)
        } else {
            capped_delay
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    ExponentialWithJitter,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "exponential-jitter" | "exponential_with_jitter" | "jitter" => {
                Ok(BackoffStrategy::ExponentialWithJitter)
            }
            other => Err(ResilienceError::InvalidPolicy(format!(
                "unknown backoff strategy '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let policy = exact(BackoffStrategy::Exponential);

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100)); // 100 * 2^0
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200)); // 100 * 2^1
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400)); // 100 * 2^2
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..exact(BackoffStrategy::Exponential)
        };

        assert_eq!(policy.calculate_delay(10), Duration::from_secs(5));
        // Large attempt numbers must not overflow
        assert_eq!(policy.calculate_delay(200), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = exact(BackoffStrategy::Linear);
        assert_eq!(linear.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(linear.calculate_delay(3), Duration::from_millis(300));

        let fixed = exact(BackoffStrategy::Fixed);
        assert_eq!(fixed.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = policy.calculate_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_zero_jitter_with_jitter_strategy() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..exact(BackoffStrategy::ExponentialWithJitter)
        };
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::no_retry().validate().is_ok());

        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let jitter = RetryPolicy {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(jitter.validate().is_err());

        let inverted = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "exponential".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::Exponential
        );
        assert_eq!(
            "Exponential-Jitter".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::ExponentialWithJitter
        );
        assert!("sometimes".parse::<BackoffStrategy>().is_err());
    }
}
