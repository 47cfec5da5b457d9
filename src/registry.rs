//! Instance registry: named configs, lazily established sessions and the
//! current-instance selection

use crate::config::{EnvSource, InstanceConfig};
use crate::error::{GatewayError, Result};
use crate::protocol::{AuthGrant, RpcTransport, TransportError};
use crate::session::{Session, SessionHandle, SessionHealth, SessionLimits};
use erp_gateway_core_resilience::{with_retry, FailureReason, RetryFailure, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-instance session slot; the async mutex serialises authentication
type SessionSlot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Public view of one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub name: String,
    pub url: String,
    pub database: String,
    pub username: String,
    pub connected: bool,
    pub current: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub company_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_age_secs: Option<u64>,
}

/// Base selection plus the stack of scoped overrides
#[derive(Debug)]
struct CurrentInstance {
    base: String,
    overrides: Vec<(u64, String)>,
}

impl CurrentInstance {
    fn name(&self) -> &str {
        self.overrides
            .last()
            .map(|(_, name)| name.as_str())
            .unwrap_or(&self.base)
    }
}

/// Registry of named instances and their sessions
///
/// Configs and the session table sit behind coarse `RwLock`s; each instance
/// has its own async mutex so that only one authentication per instance is
/// ever in flight.
pub struct InstanceRegistry {
    transport: Arc<dyn RpcTransport>,
    configs: RwLock<HashMap<String, Arc<InstanceConfig>>>,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    current: Mutex<CurrentInstance>,
    env: EnvSource,
    auth_policy: RetryPolicy,
    limits: SessionLimits,
    generation: AtomicU64,
    next_override: AtomicU64,
}

impl InstanceRegistry {
    /// Create a registry whose current instance is `default_instance`
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        default_instance: impl Into<String>,
        env: EnvSource,
        auth_policy: RetryPolicy,
        limits: SessionLimits,
    ) -> Self {
        Self {
            transport,
            configs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            current: Mutex::new(CurrentInstance {
                base: default_instance.into(),
                overrides: Vec::new(),
            }),
            env,
            auth_policy,
            limits,
            generation: AtomicU64::new(0),
            next_override: AtomicU64::new(0),
        }
    }

    /// Add or replace an instance config
    ///
    /// Replacing a config drops the instance's session.
    pub fn register(&self, config: InstanceConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.clone();
        info!("Registering instance: {} ({})", name, config.url);

        let replaced = self
            .configs
            .write()
            .insert(name.clone(), Arc::new(config))
            .is_some();
        if replaced {
            debug!("Config for {} replaced, dropping its session", name);
            self.sessions.write().remove(&name);
        }
        Ok(())
    }

    /// Remove an instance config and its session
    ///
    /// The current base instance cannot be removed.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if self.current.lock().base == name {
            return Err(GatewayError::config(format!(
                "cannot remove the active instance '{}'",
                name
            )));
        }

        info!("Unregistering instance: {}", name);
        self.configs
            .write()
            .remove(name)
            .ok_or_else(|| GatewayError::config(format!("unknown instance '{}'", name)))?;
        self.sessions.write().remove(name);
        Ok(())
    }

    /// Config for `name`, falling back to the environment
    pub fn config(&self, name: &str) -> Result<Arc<InstanceConfig>> {
        if let Some(config) = self.configs.read().get(name) {
            return Ok(Arc::clone(config));
        }

        let config = InstanceConfig::from_env(name, &self.env)?.ok_or_else(|| {
            GatewayError::config(format!(
                "no configuration found for instance '{}'; register it or set {}_ODOO_URL, _DB, _USERNAME and _PASSWORD",
                name,
                name.to_uppercase()
            ))
        })?;

        debug!("Loaded instance {} from environment", name);
        let mut configs = self.configs.write();
        let config = configs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(config));
        Ok(Arc::clone(config))
    }

    /// Sorted names of registered and environment-defined instances
    pub fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        names.extend(self.env.discover_instances());
        names.sort();
        names.dedup();
        names
    }

    /// Name of the instance used when a call names none
    pub fn current(&self) -> String {
        self.current.lock().name().to_string()
    }

    /// Change the base instance; returns the previous one
    pub fn switch(&self, name: &str) -> Result<String> {
        self.config(name)?;
        let mut current = self.current.lock();
        let previous = std::mem::replace(&mut current.base, name.to_string());
        info!("Switched instance: {} -> {}", previous, name);
        Ok(previous)
    }

    /// Push a scoped override; it is removed when the guard drops
    ///
    /// The selection is registry-wide: while the guard lives, every caller
    /// resolving without an explicit name gets `name`, not only the task that
    /// holds the guard. Pass the instance name explicitly to stay isolated.
    pub fn scope(&self, name: &str) -> Result<InstanceScope<'_>> {
        self.config(name)?;
        let id = self.next_override.fetch_add(1, Ordering::Relaxed);
        self.current.lock().overrides.push((id, name.to_string()));
        debug!("Entered instance scope {} ({})", name, id);
        Ok(InstanceScope { registry: self, id })
    }

    /// Run `f` with `name` as the current instance
    ///
    /// The previous selection is restored on every exit path, including
    /// errors, panics and cancellation of the returned future. Like
    /// [`scope`](Self::scope), the override is visible to concurrent callers.
    pub async fn with_instance<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _scope = self.scope(name)?;
        f().await
    }

    /// Resolve a session for `name` (or the current instance)
    ///
    /// A missing or invalid session is (re)authenticated; a stale one is
    /// validated first and re-authenticated if validation fails.
    pub async fn resolve(&self, name: Option<&str>) -> Result<SessionHandle> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.current(),
        };
        let config = self.config(&name)?;
        let slot = self.slot(&name);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_mut() {
            match session.health(&self.limits) {
                SessionHealth::Fresh => {
                    session.mark_used();
                    return Ok(session.handle());
                }
                SessionHealth::Stale => {
                    debug!("Validating stale session for {}", name);
                    match self.transport.validate(&config, session.grant()).await {
                        Ok(()) => {
                            session.mark_validated();
                            return Ok(session.handle());
                        }
                        Err(e) => {
                            warn!("Session for {} failed validation: {}", name, e);
                            session.mark_invalid();
                        }
                    }
                }
                SessionHealth::Invalid => {
                    debug!("Session for {} is invalid, re-authenticating", name);
                }
            }
        }

        match self.authenticate(&config).await {
            Ok(grant) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "Session established for {} (uid {}, generation {})",
                    name, grant.uid, generation
                );
                let session = Session::new(config, grant, generation);
                let handle = session.handle();
                *guard = Some(session);
                Ok(handle)
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Mark the session behind `handle` invalid, unless it was already
    /// replaced by a newer one
    pub async fn invalidate(&self, handle: &SessionHandle) {
        let Some(slot) = self.sessions.read().get(handle.instance()).cloned() else {
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.generation() == handle.generation() {
                debug!(
                    "Invalidating session for {} (generation {})",
                    handle.instance(),
                    handle.generation()
                );
                session.mark_invalid();
            }
        }
    }

    /// Drop the session of one instance, keeping its config
    pub async fn disconnect(&self, name: &str) -> bool {
        let Some(slot) = self.sessions.read().get(name).cloned() else {
            return false;
        };
        let had_session = slot.lock().await.take().is_some();
        if had_session {
            info!("Disconnected from {}", name);
        }
        had_session
    }

    /// Drop every session
    pub async fn disconnect_all(&self) {
        let slots: Vec<SessionSlot> = self.sessions.read().values().cloned().collect();
        for slot in slots {
            slot.lock().await.take();
        }
        info!("Disconnected from all instances");
    }

    /// Describe `name` (or the current instance)
    pub async fn instance_info(&self, name: Option<&str>) -> Result<InstanceInfo> {
        let current = self.current();
        let name = name.map(str::to_string).unwrap_or_else(|| current.clone());
        let config = self.config(&name)?;

        let mut info = InstanceInfo {
            name: name.clone(),
            url: config.url.clone(),
            database: config.database.clone(),
            username: config.username.clone(),
            connected: false,
            current: name == current,
            uid: None,
            server_version: None,
            company_ids: Vec::new(),
            session_age_secs: None,
        };

        let slot = self.sessions.read().get(&name).cloned();
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.as_ref() {
                info.connected = true;
                info.uid = Some(session.grant().uid);
                info.server_version = session.grant().server_version.clone();
                info.company_ids = session.grant().company_ids.clone();
                info.session_age_secs = Some(session.age().as_secs());
            }
        }
        Ok(info)
    }

    fn slot(&self, name: &str) -> SessionSlot {
        if let Some(slot) = self.sessions.read().get(name) {
            return Arc::clone(slot);
        }
        Arc::clone(self.sessions.write().entry(name.to_string()).or_default())
    }

    async fn authenticate(&self, config: &InstanceConfig) -> Result<AuthGrant> {
        info!("Authenticating to {} as {}", config.name, config.username);

        with_retry(
            &self.auth_policy,
            TransportError::class,
            |_| self.transport.authenticate(config),
        )
        .await
        .map(|retried| retried.value)
        .map_err(|failure| auth_error(config, failure))
    }
}

fn auth_error(config: &InstanceConfig, failure: RetryFailure<TransportError>) -> GatewayError {
    match failure.reason {
        FailureReason::AuthRejected => GatewayError::Authentication {
            instance: config.name.clone(),
            message: failure.error.to_string(),
        },
        FailureReason::RetriesExhausted => GatewayError::TransientRemote {
            instance: config.name.clone(),
            operation: "authenticate".to_string(),
            attempts: failure.attempts,
            message: failure.error.to_string(),
        },
        FailureReason::Permanent => GatewayError::PermanentRemote {
            instance: config.name.clone(),
            operation: "authenticate".to_string(),
            diagnostic: failure.error.diagnostic(),
        },
    }
}

/// Guard for a scoped instance override
///
/// Dropping the guard removes exactly its own override, so nested and
/// interleaved scopes unwind correctly.
pub struct InstanceScope<'a> {
    registry: &'a InstanceRegistry,
    id: u64,
}

impl Drop for InstanceScope<'_> {
    fn drop(&mut self) {
        let mut current = self.registry.current.lock();
        if let Some(pos) = current.overrides.iter().position(|(id, _)| *id == self.id) {
            let (_, name) = current.overrides.remove(pos);
            debug!("Left instance scope {} ({})", name, self.id);
        }
    }
}
