/*!
 * Upstream protocol: call model, transport trait and implementations
 *
 * Payloads stay dynamic (`serde_json::Value`) until they reach a transport;
 * the gateway forwards model and method names verbatim and only looks at the
 * transport/envelope outcome.
 */

pub mod error;
pub mod jsonrpc;
pub mod mock;

pub use error::{classify_exception, TransportError, TransportResult};
pub use jsonrpc::JsonRpcTransport;
pub use mock::MockTransport;

use crate::config::InstanceConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Positional and keyword arguments of one remote call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcArgs {
    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RpcArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Accept either a bare JSON array (positional only) or an object with
    /// `args` and/or `kwargs`
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(args) => Ok(Self::positional(args)),
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| GatewayError::config(format!("invalid call arguments: {}", e))),
            Value::Null => Ok(Self::new()),
            other => Err(GatewayError::config(format!(
                "call arguments must be an array or object, got {}",
                other
            ))),
        }
    }
}

/// One logical remote call: method `method` on model `model`
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub model: String,
    pub method: String,
    pub args: RpcArgs,
}

impl RemoteCall {
    pub fn new(model: impl Into<String>, method: impl Into<String>, args: RpcArgs) -> Self {
        Self {
            model: model.into(),
            method: method.into(),
            args,
        }
    }

    /// `model.method`, used for logging and metrics
    pub fn operation(&self) -> String {
        format!("{}.{}", self.model, self.method)
    }
}

/// Result of a successful login
#[derive(Clone)]
pub struct AuthGrant {
    /// Authenticated user id
    pub uid: i64,

    /// Credential presented on every subsequent call
    pub token: SecretString,

    pub server_version: Option<String>,

    pub company_ids: Vec<i64>,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("uid", &self.uid)
            .field("token", &"[REDACTED]")
            .field("server_version", &self.server_version)
            .field("company_ids", &self.company_ids)
            .finish()
    }
}

/// Transport to a session-authenticated ERP endpoint
///
/// Implementations classify failures through [`TransportError`]; they never
/// retry on their own.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Log in and return the session grant
    async fn authenticate(&self, config: &InstanceConfig) -> TransportResult<AuthGrant>;

    /// Cheap call proving the grant is still accepted
    async fn validate(&self, config: &InstanceConfig, grant: &AuthGrant) -> TransportResult<()>;

    /// Execute `call` with the given grant
    async fn execute(
        &self,
        config: &InstanceConfig,
        grant: &AuthGrant,
        call: &RemoteCall,
    ) -> TransportResult<Value>;
}
