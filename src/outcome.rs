/*!
 * Structured outcome of a top-level gateway call
 */

use crate::batch::{BatchJob, ItemFailure, JobStatus};
use crate::error::{ErrorKind, GatewayError, RemoteDiagnostic, Result, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failure,
    Cancelled,
}

/// Error half of an outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<RemoteDiagnostic>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub item_failures: Vec<ItemFailure>,
}

impl From<&GatewayError> for ErrorReport {
    fn from(err: &GatewayError) -> Self {
        let item_failures = match err {
            GatewayError::PartialBatchFailure { failures, .. } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            diagnostic: err.diagnostic().cloned(),
            item_failures,
        }
    }
}

/// Serialisable result handed back to callers
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchJob>,
}

impl Outcome {
    pub fn success(value: Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            value: Some(value),
            error: None,
            batch: None,
        }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        let status = match err {
            GatewayError::PartialBatchFailure { .. } => OutcomeStatus::Partial,
            GatewayError::Cancelled(_) => OutcomeStatus::Cancelled,
            _ => OutcomeStatus::Failure,
        };
        Self {
            status,
            value: None,
            error: Some(ErrorReport::from(err)),
            batch: None,
        }
    }

    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e) => Self::from_error(&e),
        }
    }

    /// Outcome of a finished batch; item failures are listed in the error
    pub fn from_batch(job: BatchJob) -> Self {
        let (status, kind) = match job.status {
            JobStatus::Succeeded => (OutcomeStatus::Success, None),
            JobStatus::Partial => (OutcomeStatus::Partial, Some(ErrorKind::PartialBatch)),
            JobStatus::Failed => (OutcomeStatus::Failure, Some(ErrorKind::PartialBatch)),
            JobStatus::Cancelled => (OutcomeStatus::Cancelled, Some(ErrorKind::Cancelled)),
        };

        let error = kind.map(|kind| ErrorReport {
            kind,
            message: format!(
                "{} of {} items succeeded, {} failed",
                job.succeeded, job.total_items, job.failed
            ),
            retryable: true,
            diagnostic: None,
            item_failures: job.partial_errors.clone(),
        });

        Self {
            status,
            value: None,
            error,
            batch: Some(job),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Process exit code: 0 success, 1 partial, 2 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.status {
            OutcomeStatus::Success => EXIT_SUCCESS,
            OutcomeStatus::Partial => EXIT_PARTIAL,
            OutcomeStatus::Failure | OutcomeStatus::Cancelled => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_outcome() {
        let outcome = Outcome::from_result(Ok(json!([1, 2])));
        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), EXIT_SUCCESS);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_permanent_failure_carries_diagnostic() {
        let err = GatewayError::PermanentRemote {
            instance: "a".to_string(),
            operation: "res.partner.create".to_string(),
            diagnostic: RemoteDiagnostic::new("Missing required field")
                .with_name("odoo.exceptions.ValidationError"),
        };
        let outcome = Outcome::from_error(&err);
        assert_eq!(outcome.exit_code(), EXIT_FATAL);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["error"]["kind"], "permanent");
        assert_eq!(json["error"]["retryable"], false);
        assert_eq!(
            json["error"]["diagnostic"]["name"],
            "odoo.exceptions.ValidationError"
        );
    }

    #[test]
    fn test_partial_batch_error_lists_items() {
        let err = GatewayError::PartialBatchFailure {
            total: 3,
            succeeded: 2,
            failed: 1,
            failures: vec![ItemFailure {
                index: 2,
                item: json!(42),
                kind: ErrorKind::Permanent,
                reason: "bad".to_string(),
            }],
        };
        let outcome = Outcome::from_error(&err);
        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.exit_code(), EXIT_PARTIAL);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["error"]["kind"], "partial_batch");
        assert_eq!(json["error"]["item_failures"][0]["item"], 42);
    }

    #[test]
    fn test_configuration_error_outcome() {
        let outcome = Outcome::from_error(&GatewayError::config("no such instance"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["error"]["kind"], "configuration");
        assert!(json["error"].get("item_failures").is_none());
    }
}
