//! Generic retry driver built on [`RetryMachine`]
//!
//! `with_retry` runs an async operation, classifies each error with a caller
//! supplied function and sleeps between attempts as the machine instructs.
//! Authentication rejections are retried immediately, once; callers that need
//! to refresh state before that retry should drive [`RetryMachine`] directly.

use crate::backoff::RetryPolicy;
use crate::state_machine::{AttemptState, FailureReason, FaultClass, RetryMachine};
use std::fmt;
use std::future::Future;
use tracing::debug;

/// Successful result together with the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final error of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    /// Error returned by the last attempt
    pub error: E,
    pub attempts: u32,
    pub reason: FailureReason,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.reason, self.attempts, self.error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryFailure<E> {}

/// Execute `op` until it succeeds or the policy gives up
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FaultClass,
    E: fmt::Display,
{
    let mut machine = RetryMachine::new(policy.clone());

    loop {
        let attempt = machine.attempts();
        match op(attempt).await {
            Ok(value) => {
                machine.record_success();
                return Ok(Retried {
                    value,
                    attempts: machine.attempts(),
                });
            }
            Err(error) => match machine.record_fault(classify(&error)) {
                AttemptState::TransientRetry { attempt, delay } => {
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?}",
                        attempt, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    machine.resume();
                }
                AttemptState::AuthRetry { attempt } => {
                    debug!("Attempt {} rejected ({}), retrying once", attempt, error);
                    machine.resume();
                }
                AttemptState::Failed { attempts, reason } => {
                    return Err(RetryFailure {
                        error,
                        attempts,
                        reason,
                    });
                }
                // record_fault never yields these from Attempting
                AttemptState::Attempting { .. } | AttemptState::Succeeded { .. } => {
                    return Err(RetryFailure {
                        error,
                        attempts: machine.attempts(),
                        reason: FailureReason::Permanent,
                    });
                }
            },
        }
    }
}
