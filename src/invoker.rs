//! Remote invoker: one logical call with classification, retry and
//! transparent re-authentication

use crate::error::{GatewayError, Result};
use crate::metrics::CallMetrics;
use crate::protocol::{RemoteCall, RpcTransport, TransportError};
use crate::registry::InstanceRegistry;
use crate::session::SessionHandle;
use erp_gateway_core_resilience::{AttemptState, FailureReason, RetryMachine, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Default threshold above which a call is logged as slow
pub const DEFAULT_SLOW_CALL: Duration = Duration::from_secs(1);

/// Issues remote calls through registry-managed sessions
pub struct RemoteInvoker {
    registry: Arc<InstanceRegistry>,
    transport: Arc<dyn RpcTransport>,
    policy: RetryPolicy,
    metrics: Arc<CallMetrics>,
    slow_call: Duration,
}

impl RemoteInvoker {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        transport: Arc<dyn RpcTransport>,
        policy: RetryPolicy,
        metrics: Arc<CallMetrics>,
    ) -> Self {
        Self {
            registry,
            transport,
            policy,
            metrics,
            slow_call: DEFAULT_SLOW_CALL,
        }
    }

    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call = threshold;
        self
    }

    pub fn slow_call_threshold(&self) -> Duration {
        self.slow_call
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<CallMetrics> {
        &self.metrics
    }

    /// Execute `call` through `session`
    ///
    /// Transient faults are retried with backoff up to the policy's attempt
    /// limit. An authentication rejection invalidates the session, resolves a
    /// fresh one and retries once outside that budget. Permanent faults are
    /// returned immediately with the remote diagnostic.
    pub async fn call(&self, session: &SessionHandle, call: &RemoteCall) -> Result<Value> {
        let started = Instant::now();
        let result = self.drive(session.clone(), call).await;
        let elapsed = started.elapsed();

        let operation = call.operation();
        self.metrics.record(&operation, elapsed, result.is_ok());
        if elapsed >= self.slow_call {
            warn!(
                "Slow call {} on {}: {:.2}s",
                operation,
                session.instance(),
                elapsed.as_secs_f64()
            );
        }
        result
    }

    async fn drive(&self, mut session: SessionHandle, call: &RemoteCall) -> Result<Value> {
        let mut machine = RetryMachine::new(self.policy.clone());

        loop {
            let error = match self
                .transport
                .execute(session.config(), session.grant(), call)
                .await
            {
                Ok(value) => {
                    machine.record_success();
                    if machine.attempts() > 1 {
                        debug!(
                            "{} on {} succeeded after {} attempts",
                            call.operation(),
                            session.instance(),
                            machine.attempts()
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            match machine.record_fault(error.class()) {
                AttemptState::TransientRetry { attempt, delay } => {
                    debug!(
                        "{} on {} attempt {} failed ({}), retrying in {:?}",
                        call.operation(),
                        session.instance(),
                        attempt,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    machine.resume();
                }
                AttemptState::AuthRetry { attempt } => {
                    warn!(
                        "Session for {} rejected on attempt {} ({}), re-authenticating",
                        session.instance(),
                        attempt,
                        error
                    );
                    let instance = session.instance().to_string();
                    self.registry.invalidate(&session).await;
                    session = self.registry.resolve(Some(instance.as_str())).await?;
                    machine.resume();
                }
                AttemptState::Failed { attempts, reason } => {
                    let err = failure(&session, call, error, attempts, reason);
                    error!("{}", err);
                    return Err(err);
                }
                AttemptState::Attempting { .. } | AttemptState::Succeeded { .. } => {
                    return Err(GatewayError::Internal(format!(
                        "retry machine in unexpected state after fault on {}",
                        call.operation()
                    )));
                }
            }
        }
    }
}

fn failure(
    session: &SessionHandle,
    call: &RemoteCall,
    error: TransportError,
    attempts: u32,
    reason: FailureReason,
) -> GatewayError {
    match reason {
        FailureReason::RetriesExhausted => GatewayError::TransientRemote {
            instance: session.instance().to_string(),
            operation: call.operation(),
            attempts,
            message: error.to_string(),
        },
        FailureReason::AuthRejected => GatewayError::Authentication {
            instance: session.instance().to_string(),
            message: error.to_string(),
        },
        FailureReason::Permanent => GatewayError::PermanentRemote {
            instance: session.instance().to_string(),
            operation: call.operation(),
            diagnostic: error.diagnostic(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvSource, InstanceConfig};
    use crate::error::{ErrorKind, RemoteDiagnostic};
    use crate::protocol::{MockTransport, RpcArgs};
    use crate::session::SessionLimits;
    use erp_gateway_core_resilience::{BackoffStrategy, FaultClass};
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff: BackoffStrategy::Exponential,
            jitter_factor: 0.0,
        }
    }

    fn setup() -> (MockTransport, Arc<InstanceRegistry>, RemoteInvoker) {
        let mock = MockTransport::new();
        let transport: Arc<dyn RpcTransport> = Arc::new(mock.clone());
        let registry = Arc::new(InstanceRegistry::new(
            Arc::clone(&transport),
            "a",
            EnvSource::Disabled,
            policy(),
            SessionLimits::default(),
        ));
        registry
            .register(InstanceConfig::new("a", "a.local", "db", "admin", "pw"))
            .unwrap();
        let invoker = RemoteInvoker::new(
            Arc::clone(&registry),
            transport,
            policy(),
            Arc::new(CallMetrics::new()),
        );
        (mock, registry, invoker)
    }

    fn read_call() -> RemoteCall {
        RemoteCall::new("res.partner", "read", RpcArgs::new().arg(json!([1])))
    }

    fn flaky() -> TransportError {
        TransportError::Connect("connection reset".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let (mock, registry, invoker) = setup();
        for _ in 0..3 {
            mock.push_result("res.partner", "read", Err(flaky()));
        }
        mock.push_result("res.partner", "read", Ok(json!([{"id": 1}])));

        let session = registry.resolve(None).await.unwrap();
        let value = invoker.call(&session, &read_call()).await.unwrap();

        assert_eq!(value, json!([{"id": 1}]));
        assert_eq!(mock.count_calls("res.partner", "read"), 4);
        assert_eq!(mock.auth_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion() {
        let (mock, registry, invoker) = setup();
        mock.on("res.partner", "read", |_| Err(flaky()));

        let session = registry.resolve(None).await.unwrap();
        let err = invoker.call(&session, &read_call()).await.unwrap_err();

        assert!(matches!(
            err,
            GatewayError::TransientRemote { attempts: 4, .. }
        ));
        assert!(err.is_retryable());
        assert_eq!(mock.count_calls("res.partner", "read"), 4);

        let summary = invoker.metrics().summary();
        assert_eq!(summary[0].operation, "res.partner.read");
        assert_eq!(summary[0].errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_fails_once_without_delay() {
        let (mock, registry, invoker) = setup();
        mock.on("res.partner", "read", |_| {
            Err(TransportError::remote(
                RemoteDiagnostic::new("Record does not exist")
                    .with_name("odoo.exceptions.MissingError"),
            ))
        });

        let session = registry.resolve(None).await.unwrap();
        let started = Instant::now();
        let err = invoker.call(&session, &read_call()).await.unwrap_err();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(
            err.diagnostic().and_then(|d| d.name.as_deref()),
            Some("odoo.exceptions.MissingError")
        );
        assert_eq!(mock.count_calls("res.partner", "read"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_reauthenticates_once() {
        let (mock, registry, invoker) = setup();
        mock.on("res.partner", "read", |_| Ok(json!([])));

        let session = registry.resolve(None).await.unwrap();
        mock.expire_sessions();

        let value = invoker.call(&session, &read_call()).await.unwrap();
        assert_eq!(value, json!([]));
        assert_eq!(mock.auth_count(), 2);
        assert_eq!(mock.count_calls("res.partner", "read"), 2);

        let fresh = registry.resolve(None).await.unwrap();
        assert!(fresh.generation() > session.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rejection_is_authentication_error() {
        let (mock, registry, invoker) = setup();
        let rejected = || TransportError::Remote {
            class: FaultClass::AuthRejected,
            diagnostic: RemoteDiagnostic::new("Access Denied")
                .with_name("odoo.exceptions.AccessDenied"),
        };
        mock.push_result("res.partner", "read", Err(rejected()));
        mock.push_result("res.partner", "read", Err(rejected()));

        let session = registry.resolve(None).await.unwrap();
        let err = invoker.call(&session, &read_call()).await.unwrap_err();

        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert_eq!(mock.auth_count(), 2);
        assert_eq!(mock.count_calls("res.partner", "read"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_retry_outside_transient_budget() {
        let (mock, registry, invoker) = setup();
        for _ in 0..3 {
            mock.push_result("res.partner", "read", Err(flaky()));
        }
        mock.push_result(
            "res.partner",
            "read",
            Err(TransportError::Remote {
                class: FaultClass::AuthRejected,
                diagnostic: RemoteDiagnostic::new("Session expired"),
            }),
        );
        mock.push_result("res.partner", "read", Ok(json!(true)));

        let session = registry.resolve(None).await.unwrap();
        let value = invoker.call(&session, &read_call()).await.unwrap();

        assert_eq!(value, json!(true));
        assert_eq!(mock.count_calls("res.partner", "read"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_still_succeeds() {
        let (mock, registry, _) = setup();
        let mock = mock.with_call_latency(Duration::from_secs(2));
        let invoker = RemoteInvoker::new(
            Arc::clone(&registry),
            Arc::new(mock.clone()),
            policy(),
            Arc::new(CallMetrics::new()),
        )
        .with_slow_call_threshold(Duration::from_millis(500));

        let session = registry.resolve(None).await.unwrap();
        invoker.call(&session, &read_call()).await.unwrap();

        let summary = invoker.metrics().summary();
        assert_eq!(summary[0].max_ms, 2000);
    }
}
