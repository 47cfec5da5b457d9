//! Retry state machine
//!
//! One logical operation moves through the states below. The machine never
//! sleeps or performs I/O; the driver asks it what to do next and acts on the
//! answer.
//!
//! ```text
//!                 ┌──────────────┐   success    ┌───────────┐
//!        ┌──────► │  Attempting  │ ───────────► │ Succeeded │
//!        │        └──────┬───────┘              └───────────┘
//!        │   transient   │   auth rejected   permanent / exhausted
//!        │     ┌─────────┼──────────────┐──────────────┐
//!        │     ▼         ▼              │              ▼
//!  ┌─────┴──────────┐ ┌───────────┐     │        ┌──────────┐
//!  │ TransientRetry │ │ AuthRetry │     └──────► │  Failed  │
//!  └────────────────┘ └─────┬─────┘              └──────────┘
//!        ▲   resume         │ resume
//!        └──────────────────┘
//! ```
//!
//! Transient failures draw from the policy's attempt budget. An authentication
//! rejection earns exactly one extra attempt that does not count against it.

use crate::backoff::RetryPolicy;
use std::fmt;
use std::time::Duration;

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Network-level or server-busy failure; retry after backoff
    Transient,
    /// The remote rejected the session or credentials
    AuthRejected,
    /// Any other failure; retrying cannot help
    Permanent,
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::Transient => write!(f, "transient"),
            FaultClass::AuthRejected => write!(f, "auth_rejected"),
            FaultClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Why the machine ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// A permanent fault was observed
    Permanent,
    /// The transient budget ran out
    RetriesExhausted,
    /// Authentication was rejected again after the recovery attempt
    AuthRejected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Permanent => write!(f, "permanent failure"),
            FailureReason::RetriesExhausted => write!(f, "retries exhausted"),
            FailureReason::AuthRejected => write!(f, "authentication rejected"),
        }
    }
}

/// Current state of one retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Attempt number `attempt` (1-based) is in flight
    Attempting { attempt: u32 },
    /// Wait `delay`, then resume
    TransientRetry { attempt: u32, delay: Duration },
    /// Re-establish the session, then resume immediately
    AuthRetry { attempt: u32 },
    /// Terminal: the last attempt succeeded
    Succeeded { attempts: u32 },
    /// Terminal: no further attempts will be made
    Failed { attempts: u32, reason: FailureReason },
}

impl AttemptState {
    /// True for `Succeeded` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded { .. } | AttemptState::Failed { .. }
        )
    }
}

/// Retry state machine with its counters as state
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: AttemptState,
    attempts: u32,
    transient_failures: u32,
    auth_retries_used: u32,
    max_auth_retries: u32,
}

impl RetryMachine {
    /// Start a new operation; the first attempt is considered in flight
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: AttemptState::Attempting { attempt: 1 },
            attempts: 1,
            transient_failures: 0,
            auth_retries_used: 0,
            max_auth_retries: 1,
        }
    }

    /// Treat authentication rejection as final on the first occurrence
    pub fn without_auth_retry(mut self) -> Self {
        self.max_auth_retries = 0;
        self
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Number of attempts issued so far, including the current one
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The in-flight attempt succeeded
    pub fn record_success(&mut self) -> AttemptState {
        if let AttemptState::Attempting { .. } = self.state {
            self.state = AttemptState::Succeeded {
                attempts: self.attempts,
            };
        }
        self.state
    }

    /// The in-flight attempt failed with the given class
    pub fn record_fault(&mut self, class: FaultClass) -> AttemptState {
        let AttemptState::Attempting { attempt } = self.state else {
            return self.state;
        };

        self.state = match class {
            FaultClass::Transient => {
                self.transient_failures += 1;
                if self.transient_failures >= self.policy.max_attempts {
                    AttemptState::Failed {
                        attempts: self.attempts,
                        reason: FailureReason::RetriesExhausted,
                    }
                } else {
                    AttemptState::TransientRetry {
                        attempt,
                        delay: self.policy.calculate_delay(self.transient_failures),
                    }
                }
            }
            FaultClass::AuthRejected => {
                if self.auth_retries_used < self.max_auth_retries {
                    self.auth_retries_used += 1;
                    AttemptState::AuthRetry { attempt }
                } else {
                    AttemptState::Failed {
                        attempts: self.attempts,
                        reason: FailureReason::AuthRejected,
                    }
                }
            }
            FaultClass::Permanent => AttemptState::Failed {
                attempts: self.attempts,
                reason: FailureReason::Permanent,
            },
        };
        self.state
    }

    /// Leave a retry state and put the next attempt in flight
    pub fn resume(&mut self) -> AttemptState {
        if matches!(
            self.state,
            AttemptState::TransientRetry { .. } | AttemptState::AuthRetry { .. }
        ) {
            self.attempts += 1;
            self.state = AttemptState::Attempting {
                attempt: self.attempts,
            };
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffStrategy;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Exponential,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_success_first_try() {
        let mut machine = RetryMachine::new(policy(3));
        assert_eq!(
            machine.record_success(),
            AttemptState::Succeeded { attempts: 1 }
        );
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_transient_then_success() {
        let mut machine = RetryMachine::new(policy(4));

        for k in 1..=3 {
            let state = machine.record_fault(FaultClass::Transient);
            assert!(matches!(state, AttemptState::TransientRetry { attempt, .. } if attempt == k));
            machine.resume();
        }

        assert_eq!(
            machine.record_success(),
            AttemptState::Succeeded { attempts: 4 }
        );
    }

    #[test]
    fn test_transient_delays_grow() {
        let mut machine = RetryMachine::new(policy(4));

        let mut delays = Vec::new();
        for _ in 0..3 {
            if let AttemptState::TransientRetry { delay, .. } =
                machine.record_fault(FaultClass::Transient)
            {
                delays.push(delay);
            }
            machine.resume();
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn test_transient_exhaustion() {
        let mut machine = RetryMachine::new(policy(3));

        machine.record_fault(FaultClass::Transient);
        machine.resume();
        machine.record_fault(FaultClass::Transient);
        machine.resume();
        let state = machine.record_fault(FaultClass::Transient);

        assert_eq!(
            state,
            AttemptState::Failed {
                attempts: 3,
                reason: FailureReason::RetriesExhausted
            }
        );
    }

    #[test]
    fn test_permanent_fails_immediately() {
        let mut machine = RetryMachine::new(policy(5));
        let state = machine.record_fault(FaultClass::Permanent);
        assert_eq!(
            state,
            AttemptState::Failed {
                attempts: 1,
                reason: FailureReason::Permanent
            }
        );
    }

    #[test]
    fn test_auth_retry_outside_transient_budget() {
        let mut machine = RetryMachine::new(policy(2));

        machine.record_fault(FaultClass::Transient);
        machine.resume();
        assert_eq!(
            machine.record_fault(FaultClass::AuthRejected),
            AttemptState::AuthRetry { attempt: 2 }
        );
        machine.resume();

        // Budget of two transient failures still has one left to consume
        assert_eq!(
            machine.record_success(),
            AttemptState::Succeeded { attempts: 3 }
        );
    }

    #[test]
    fn test_second_auth_rejection_fails() {
        let mut machine = RetryMachine::new(policy(4));

        machine.record_fault(FaultClass::AuthRejected);
        machine.resume();
        let state = machine.record_fault(FaultClass::AuthRejected);

        assert_eq!(
            state,
            AttemptState::Failed {
                attempts: 2,
                reason: FailureReason::AuthRejected
            }
        );
    }

    #[test]
    fn test_without_auth_retry() {
        let mut machine = RetryMachine::new(policy(4)).without_auth_retry();
        assert!(matches!(
            machine.record_fault(FaultClass::AuthRejected),
            AttemptState::Failed {
                reason: FailureReason::AuthRejected,
                ..
            }
        ));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut machine = RetryMachine::new(policy(3));
        machine.record_fault(FaultClass::Permanent);

        let failed = machine.state();
        assert_eq!(machine.resume(), failed);
        assert_eq!(machine.record_success(), failed);
        assert_eq!(machine.record_fault(FaultClass::Transient), failed);
    }
}
