/*!
 * Error types for the ERP gateway
 */

use crate::batch::ItemFailure;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Diagnostic details reported by the remote endpoint for a failed call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteDiagnostic {
    /// Envelope-level error code (JSON-RPC `error.code`) or HTTP status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    /// Server-side exception name, e.g. `odoo.exceptions.ValidationError`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub message: String,

    /// Server traceback, when the endpoint sends one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl RemoteDiagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for RemoteDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Missing or invalid instance configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Credentials rejected, including after the single recovery attempt
    #[error("Authentication failed for instance '{instance}': {message}")]
    Authentication { instance: String, message: String },

    /// Transient failures outlasted the retry budget
    #[error("Remote call {operation} on '{instance}' failed after {attempts} attempts: {message}")]
    TransientRemote {
        instance: String,
        operation: String,
        attempts: u32,
        message: String,
    },

    /// The remote rejected the call; retrying cannot help
    #[error("Remote call {operation} on '{instance}' failed: {diagnostic}")]
    PermanentRemote {
        instance: String,
        operation: String,
        diagnostic: RemoteDiagnostic,
    },

    /// Some batch items failed after all retries
    #[error("Batch partially failed: {succeeded} of {total} items succeeded, {failed} failed")]
    PartialBatchFailure {
        total: usize,
        succeeded: usize,
        failed: usize,
        failures: Vec<ItemFailure>,
    },

    /// The operation was cancelled before completing
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Local I/O failure, e.g. writing an export
    #[error("I/O error: {0}")]
    Io(String),

    /// Unexpected internal failure (task panic, closed channel)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Configuration(msg.into())
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::PartialBatchFailure { .. } => EXIT_PARTIAL,
            _ => EXIT_FATAL,
        }
    }

    /// Get error kind for logging and structured outcomes
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Configuration(_) => ErrorKind::Configuration,
            GatewayError::Authentication { .. } => ErrorKind::Authentication,
            GatewayError::TransientRemote { .. } => ErrorKind::Transient,
            GatewayError::PermanentRemote { .. }
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => ErrorKind::Permanent,
            GatewayError::PartialBatchFailure { .. } => ErrorKind::PartialBatch,
            GatewayError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether a later resubmission of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientRemote { .. }
                | GatewayError::PartialBatchFailure { .. }
                | GatewayError::Cancelled(_)
        )
    }

    /// Configuration and authentication failures need operator action
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Configuration(_) | GatewayError::Authentication { .. }
        )
    }

    /// Remote diagnostic, for permanent remote failures
    pub fn diagnostic(&self) -> Option<&RemoteDiagnostic> {
        match self {
            GatewayError::PermanentRemote { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Transient,
    Permanent,
    PartialBatch,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Authentication => write!(f, "authentication"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::PartialBatch => write!(f, "partial_batch"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Configuration(format!("TOML parse error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<csv::Error> for GatewayError {
    fn from(err: csv::Error) -> Self {
        GatewayError::Io(format!("CSV write error: {}", err))
    }
}
