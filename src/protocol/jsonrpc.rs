//! JSON-RPC transport for Odoo-style endpoints
//!
//! Every call is a POST to `{url}/jsonrpc` with a `call` envelope naming a
//! service (`common` for login, `object` for model methods):
//!
//! ```text
//! {"jsonrpc": "2.0", "method": "call", "id": 7,
//!  "params": {"service": "object", "method": "execute_kw",
//!             "args": [db, uid, password, model, method, args, kwargs]}}
//! ```
//!
//! Failures come back either as HTTP errors or as an `error` member whose
//! `data.name` carries the server-side exception class.

use super::error::{TransportError, TransportResult};
use super::{AuthGrant, RemoteCall, RpcArgs, RpcTransport};
use crate::config::InstanceConfig;
use crate::error::RemoteDiagnostic;
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Longest HTTP error body kept in a diagnostic
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    timeout_secs: u64,
    verify_ssl: bool,
}

/// HTTP(S) JSON-RPC transport
///
/// HTTP clients are pooled per (timeout, TLS verification) pair so that
/// instances with the same settings share connections.
#[derive(Debug, Default)]
pub struct JsonRpcTransport {
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, config: &InstanceConfig) -> TransportResult<reqwest::Client> {
        let key = ClientKey {
            timeout_secs: config.timeout,
            verify_ssl: config.verify_ssl,
        };

        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to build HTTP client: {}", e)))?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn rpc(
        &self,
        config: &InstanceConfig,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> TransportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let body = request_body(id, service, method, args);
        let url = format!("{}/jsonrpc", config.url);
        let timeout = config.timeout();

        let response = self
            .client(config)?
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            truncate_body(&mut message, MAX_ERROR_BODY);
            if message.is_empty() {
                message = status.canonical_reason().unwrap_or("error").to_string();
            }
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        parse_envelope(envelope)
    }

    async fn execute_kw(
        &self,
        config: &InstanceConfig,
        uid: i64,
        token: &SecretString,
        call: &RemoteCall,
    ) -> TransportResult<Value> {
        self.rpc(
            config,
            "object",
            "execute_kw",
            vec![
                json!(config.database),
                json!(uid),
                json!(token.expose_secret()),
                json!(call.model),
                json!(call.method),
                Value::Array(call.args.args.clone()),
                Value::Object(call.args.kwargs.clone()),
            ],
        )
        .await
    }
}

#[async_trait]
impl RpcTransport for JsonRpcTransport {
    async fn authenticate(&self, config: &InstanceConfig) -> TransportResult<AuthGrant> {
        let result = self
            .rpc(
                config,
                "common",
                "authenticate",
                vec![
                    json!(config.database),
                    json!(config.username),
                    json!(config.password.expose_secret()),
                    json!({}),
                ],
            )
            .await?;

        let uid = match result {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| TransportError::Malformed(format!("invalid uid {}", n)))?,
            Value::Bool(false) | Value::Null => {
                return Err(TransportError::Rejected(format!(
                    "user '{}' on database '{}'",
                    config.username, config.database
                )))
            }
            other => {
                return Err(TransportError::Malformed(format!(
                    "unexpected authenticate result {}",
                    other
                )))
            }
        };

        let server_version = match self.rpc(config, "common", "version", Vec::new()).await {
            Ok(info) => info
                .get("server_version")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                debug!("Server version unavailable for {}: {}", config.name, e);
                None
            }
        };

        let token = config.password.clone();
        let company_ids = match self
            .execute_kw(config, uid, &token, &read_user(uid, "company_ids"))
            .await
        {
            Ok(rows) => rows
                .get(0)
                .and_then(|row| row.get("company_ids"))
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default(),
            Err(e) => {
                debug!("Company list unavailable for {}: {}", config.name, e);
                Vec::new()
            }
        };

        Ok(AuthGrant {
            uid,
            token,
            server_version,
            company_ids,
        })
    }

    async fn validate(&self, config: &InstanceConfig, grant: &AuthGrant) -> TransportResult<()> {
        let rows = self
            .execute_kw(config, grant.uid, &grant.token, &read_user(grant.uid, "id"))
            .await?;

        match rows.as_array() {
            Some(rows) if !rows.is_empty() => Ok(()),
            _ => Err(TransportError::Rejected(format!(
                "user {} is no longer readable",
                grant.uid
            ))),
        }
    }

    async fn execute(
        &self,
        config: &InstanceConfig,
        grant: &AuthGrant,
        call: &RemoteCall,
    ) -> TransportResult<Value> {
        self.execute_kw(config, grant.uid, &grant.token, call).await
    }
}

/// `res.users.read([uid], fields=[field])`
fn read_user(uid: i64, field: &str) -> RemoteCall {
    RemoteCall::new(
        "res.users",
        "read",
        RpcArgs::positional(vec![json!([uid])]).kwarg("fields", json!([field])),
    )
}

/// Build the `call` envelope for one request
pub(crate) fn request_body(id: u64, service: &str, method: &str, args: Vec<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "call",
        "params": {
            "service": service,
            "method": method,
            "args": args,
        },
        "id": id,
    })
}

/// Extract `result`, or turn `error` into a classified remote fault
pub(crate) fn parse_envelope(envelope: Value) -> TransportResult<Value> {
    let Value::Object(mut envelope) = envelope else {
        return Err(TransportError::Malformed(
            "response is not a JSON object".to_string(),
        ));
    };

    if let Some(error) = envelope.remove("error") {
        return Err(TransportError::remote(diagnostic_from_error(&error)));
    }

    envelope
        .remove("result")
        .ok_or_else(|| TransportError::Malformed("response has neither result nor error".to_string()))
}

fn diagnostic_from_error(error: &Value) -> RemoteDiagnostic {
    let data = error.get("data");
    let text = |v: Option<&Value>, key: &str| {
        v.and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let message = text(data, "message")
        .filter(|m| !m.is_empty())
        .or_else(|| text(Some(error), "message"))
        .unwrap_or_else(|| "unknown remote error".to_string());

    RemoteDiagnostic {
        code: error.get("code").and_then(Value::as_i64),
        name: text(data, "name"),
        message,
        debug: text(data, "debug"),
    }
}

/// Cut `body` to at most `max` bytes without splitting a character
fn truncate_body(body: &mut String, max: usize) {
    if body.len() <= max {
        return;
    }
    let end = body
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max)
        .last()
        .unwrap_or(0);
    body.truncate(end);
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_decode() {
        TransportError::Malformed(e.to_string())
    } else if e.is_builder() {
        TransportError::Malformed(format!("invalid request: {}", e))
    } else {
        // connect, request and body errors all mean the exchange was cut short
        TransportError::Connect(e.to_string())
    }
}
