//! Scriptable in-memory transport for testing
//!
//! `MockTransport` never touches the network. Tests queue results per
//! `model.method`, register handlers, expire every issued session, and read
//! back call counters afterwards.

use super::error::{TransportError, TransportResult};
use super::{AuthGrant, RemoteCall, RpcTransport};
use crate::config::InstanceConfig;
use crate::error::RemoteDiagnostic;
use async_trait::async_trait;
use erp_gateway_core_resilience::FaultClass;
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Handler = Arc<dyn Fn(&RemoteCall) -> TransportResult<Value> + Send + Sync>;

const TOKEN_PREFIX: &str = "mock-token-";

#[derive(Default)]
struct MockState {
    auth_calls: AtomicU32,
    validate_calls: AtomicU32,
    execute_calls: AtomicU32,
    issued_tokens: AtomicU64,
    /// Tokens numbered at or below this are rejected
    revoked_through: AtomicU64,
    auth_script: Mutex<VecDeque<TransportResult<()>>>,
    validate_script: Mutex<VecDeque<TransportResult<()>>>,
    results: Mutex<HashMap<String, VecDeque<TransportResult<Value>>>>,
    handlers: RwLock<HashMap<String, Handler>>,
    calls: Mutex<Vec<(String, RemoteCall)>>,
    auth_latency: Mutex<Duration>,
    call_latency: Mutex<Duration>,
}

/// In-memory [`RpcTransport`] for tests
///
/// # Example
///
/// ```rust
/// use erp_gateway::protocol::{MockTransport, TransportError};
/// use serde_json::json;
///
/// let mock = MockTransport::new();
/// mock.push_result("res.partner", "read", Ok(json!([{"id": 1}])));
/// mock.push_result(
///     "res.partner",
///     "write",
///     Err(TransportError::Connect("reset".to_string())),
/// );
/// assert_eq!(mock.auth_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every authentication by `latency`
    pub fn with_auth_latency(self, latency: Duration) -> Self {
        *self.state.auth_latency.lock() = latency;
        self
    }

    /// Delay every execute call by `latency`
    pub fn with_call_latency(self, latency: Duration) -> Self {
        *self.state.call_latency.lock() = latency;
        self
    }

    /// Queue the outcome of the next authentication
    pub fn push_auth_result(&self, result: TransportResult<()>) {
        self.state.auth_script.lock().push_back(result);
    }

    /// Queue `n` credential rejections
    pub fn reject_next_logins(&self, n: usize) {
        for _ in 0..n {
            self.push_auth_result(Err(TransportError::Rejected("mock".to_string())));
        }
    }

    /// Queue the outcome of the next validation
    pub fn push_validate_result(&self, result: TransportResult<()>) {
        self.state.validate_script.lock().push_back(result);
    }

    /// Queue the outcome of the next call to `model.method`
    ///
    /// Queued results are consumed before any handler is consulted.
    pub fn push_result(&self, model: &str, method: &str, result: TransportResult<Value>) {
        self.state
            .results
            .lock()
            .entry(format!("{}.{}", model, method))
            .or_default()
            .push_back(result);
    }

    /// Answer every call to `model.method` with `handler`
    pub fn on<F>(&self, model: &str, method: &str, handler: F)
    where
        F: Fn(&RemoteCall) -> TransportResult<Value> + Send + Sync + 'static,
    {
        self.state
            .handlers
            .write()
            .insert(format!("{}.{}", model, method), Arc::new(handler));
    }

    /// Answer every call without a more specific handler
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&RemoteCall) -> TransportResult<Value> + Send + Sync + 'static,
    {
        self.state
            .handlers
            .write()
            .insert("*".to_string(), Arc::new(handler));
    }

    /// Reject every session issued so far, as if the server restarted
    pub fn expire_sessions(&self) {
        let issued = self.state.issued_tokens.load(Ordering::SeqCst);
        self.state.revoked_through.store(issued, Ordering::SeqCst);
    }

    pub fn auth_count(&self) -> u32 {
        self.state.auth_calls.load(Ordering::SeqCst)
    }

    pub fn validate_count(&self) -> u32 {
        self.state.validate_calls.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> u32 {
        self.state.execute_calls.load(Ordering::SeqCst)
    }

    /// Every executed call, as (instance name, call)
    pub fn calls(&self) -> Vec<(String, RemoteCall)> {
        self.state.calls.lock().clone()
    }

    /// Number of executed calls to `model.method`
    pub fn count_calls(&self, model: &str, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(_, c)| c.model == model && c.method == method)
            .count()
    }

    fn token_revoked(&self, grant: &AuthGrant) -> bool {
        let number = grant
            .token
            .expose_secret()
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        number <= self.state.revoked_through.load(Ordering::SeqCst)
    }

    fn session_expired() -> TransportError {
        TransportError::Remote {
            class: FaultClass::AuthRejected,
            diagnostic: RemoteDiagnostic::new("Session expired")
                .with_name("odoo.http.SessionExpiredException"),
        }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn authenticate(&self, config: &InstanceConfig) -> TransportResult<AuthGrant> {
        self.state.auth_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.state.auth_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.state.auth_script.lock().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }

        let number = self.state.issued_tokens.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!("mock issued token {} for {}", number, config.name);
        Ok(AuthGrant {
            uid: 2,
            token: SecretString::new(format!("{}{}", TOKEN_PREFIX, number).into_boxed_str()),
            server_version: Some("mock-17.0".to_string()),
            company_ids: vec![1],
        })
    }

    async fn validate(&self, _config: &InstanceConfig, grant: &AuthGrant) -> TransportResult<()> {
        self.state.validate_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.state.validate_script.lock().pop_front() {
            return result;
        }
        if self.token_revoked(grant) {
            return Err(Self::session_expired());
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &InstanceConfig,
        grant: &AuthGrant,
        call: &RemoteCall,
    ) -> TransportResult<Value> {
        self.state.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .calls
            .lock()
            .push((config.name.clone(), call.clone()));

        let latency = *self.state.call_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.token_revoked(grant) {
            return Err(Self::session_expired());
        }

        let key = call.operation();
        let scripted = self
            .state
            .results
            .lock()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = scripted {
            return result;
        }

        let handler = {
            let handlers = self.state.handlers.read();
            handlers.get(&key).or_else(|| handlers.get("*")).cloned()
        };
        match handler {
            Some(handler) => handler(call),
            None => Ok(Value::Null),
        }
    }
}
