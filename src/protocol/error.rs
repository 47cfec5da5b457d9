//! Transport errors and their fault classification

use crate::error::RemoteDiagnostic;
use erp_gateway_core_resilience::FaultClass;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while talking to an endpoint
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established or was dropped
    #[error("Connection error: {0}")]
    Connect(String),

    /// No response within the instance timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    /// Error envelope returned by the endpoint
    #[error("Remote fault: {diagnostic}")]
    Remote {
        class: FaultClass,
        diagnostic: RemoteDiagnostic,
    },

    /// Login returned no user
    #[error("Credentials rejected: {0}")]
    Rejected(String),

    /// Response could not be decoded
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Fault class driving the retry state machine
    pub fn class(&self) -> FaultClass {
        match self {
            TransportError::Connect(_) | TransportError::Timeout(_) => FaultClass::Transient,
            TransportError::Http { status, .. } => match status {
                408 | 429 | 500..=599 => FaultClass::Transient,
                _ => FaultClass::Permanent,
            },
            TransportError::Remote { class, .. } => *class,
            TransportError::Rejected(_) => FaultClass::AuthRejected,
            TransportError::Malformed(_) => FaultClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FaultClass::Transient
    }

    /// Diagnostic for surfacing a permanent failure
    pub fn diagnostic(&self) -> RemoteDiagnostic {
        match self {
            TransportError::Remote { diagnostic, .. } => diagnostic.clone(),
            TransportError::Http { status, message } => {
                RemoteDiagnostic::new(message.clone()).with_code(i64::from(*status))
            }
            other => RemoteDiagnostic::new(other.to_string()),
        }
    }

    /// Build a remote fault, classifying it by exception name and message
    pub fn remote(diagnostic: RemoteDiagnostic) -> Self {
        let class = classify_exception(diagnostic.name.as_deref(), &diagnostic.message);
        TransportError::Remote { class, diagnostic }
    }
}

/// Classify a server-side exception
///
/// Session and credential rejections are recoverable by re-authenticating;
/// database contention is transient; everything else (validation, user,
/// access-rights and missing-record errors) is permanent.
pub fn classify_exception(name: Option<&str>, message: &str) -> FaultClass {
    let name = name.unwrap_or_default();

    if name.contains("AccessDenied") || name.contains("SessionExpired") {
        return FaultClass::AuthRejected;
    }

    if name.contains("OperationalError")
        || name.contains("SerializationFailure")
        || name.contains("TransactionRollbackError")
        || name.contains("LockNotAvailable")
    {
        return FaultClass::Transient;
    }

    let message = message.to_ascii_lowercase();
    if message.contains("could not serialize access") || message.contains("concurrent update") {
        return FaultClass::Transient;
    }
    if name.is_empty() && message.contains("session expired") {
        return FaultClass::AuthRejected;
    }

    FaultClass::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_transient() {
        assert_eq!(
            TransportError::Connect("reset".to_string()).class(),
            FaultClass::Transient
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(30)).class(),
            FaultClass::Transient
        );
    }

    #[test]
    fn test_http_status_classification() {
        let http = |status| TransportError::Http {
            status,
            message: String::new(),
        };
        assert_eq!(http(429).class(), FaultClass::Transient);
        assert_eq!(http(502).class(), FaultClass::Transient);
        assert_eq!(http(503).class(), FaultClass::Transient);
        assert_eq!(http(404).class(), FaultClass::Permanent);
        assert_eq!(http(400).class(), FaultClass::Permanent);
    }

    #[test]
    fn test_exception_classification() {
        assert_eq!(
            classify_exception(Some("odoo.exceptions.AccessDenied"), "Access Denied"),
            FaultClass::AuthRejected
        );
        assert_eq!(
            classify_exception(Some("odoo.http.SessionExpiredException"), "Session expired"),
            FaultClass::AuthRejected
        );
        assert_eq!(
            classify_exception(Some("odoo.exceptions.AccessError"), "not allowed"),
            FaultClass::Permanent
        );
        assert_eq!(
            classify_exception(Some("odoo.exceptions.ValidationError"), "bad"),
            FaultClass::Permanent
        );
        assert_eq!(
            classify_exception(Some("psycopg2.OperationalError"), "server closed"),
            FaultClass::Transient
        );
        assert_eq!(
            classify_exception(
                Some("psycopg2.errors.SerializationFailure"),
                "could not serialize access due to concurrent update"
            ),
            FaultClass::Transient
        );
        assert_eq!(classify_exception(None, "boom"), FaultClass::Permanent);
    }

    #[test]
    fn test_rejected_and_malformed() {
        assert_eq!(
            TransportError::Rejected("admin".to_string()).class(),
            FaultClass::AuthRejected
        );
        assert!(!TransportError::Malformed("eof".to_string()).is_retryable());
    }

    #[test]
    fn test_diagnostic_from_http() {
        let err = TransportError::Http {
            status: 404,
            message: "Not Found".to_string(),
        };
        let diag = err.diagnostic();
        assert_eq!(diag.code, Some(404));
        assert_eq!(diag.message, "Not Found");
    }
}
