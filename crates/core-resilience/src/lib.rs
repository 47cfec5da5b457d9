//! ERP Gateway Core Resilience: pure-logic retry primitives
//!
//! # Overview
//!
//! This crate holds the parts of the gateway's fault handling that need no
//! knowledge of the remote protocol:
//!
//! - **Backoff**: retry policy and delay calculation (fixed, linear,
//!   exponential, exponential with jitter)
//! - **State machine**: the per-operation retry loop as explicit state, with
//!   a separate one-shot budget for authentication recovery
//! - **Retry driver**: a generic async `with_retry` for callers that only
//!   need classify-and-sleep
//! - **Concurrency**: worker-count derivation for I/O-bound fan-out
//!
//! # Architecture
//!
//! ```text
//!   caller ──► with_retry / own driver loop
//!                   │
//!                   ▼
//!              RetryMachine ──► RetryPolicy::calculate_delay
//!                   │
//!       ┌───────────┼──────────────┐
//!       ▼           ▼              ▼
//!   Succeeded   TransientRetry   AuthRetry ──► Failed
//! ```
//!
//! # Usage Example
//!
//! ```
//! use erp_gateway_core_resilience::prelude::*;
//!
//! let mut machine = RetryMachine::new(RetryPolicy::default());
//! match machine.record_fault(FaultClass::Transient) {
//!     AttemptState::TransientRetry { delay, .. } => {
//!         // sleep for `delay`, then:
//!         machine.resume();
//!     }
//!     other => panic!("unexpected state {:?}", other),
//! }
//! assert_eq!(machine.attempts(), 2);
//! ```

pub mod backoff;
pub mod concurrency;
pub mod error;
pub mod retry;
pub mod state_machine;

// Re-export main types for convenience
pub use backoff::{BackoffStrategy, RetryPolicy};
pub use concurrency::{clamp_workers, default_worker_count};
pub use error::ResilienceError;
pub use retry::{with_retry, Retried, RetryFailure};
pub use state_machine::{AttemptState, FailureReason, FaultClass, RetryMachine};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use erp_gateway_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffStrategy, RetryPolicy};
    pub use super::concurrency::{clamp_workers, default_worker_count};
    pub use super::error::ResilienceError;
    pub use super::retry::{with_retry, Retried, RetryFailure};
    pub use super::state_machine::{AttemptState, FailureReason, FaultClass, RetryMachine};
}
