//! Error types for the resilience crate

use thiserror::Error;

/// Errors raised while building resilience primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// A retry policy cannot be used as configured
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),
}
