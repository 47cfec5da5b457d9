//! Authenticated sessions and the snapshots handed to callers

use crate::config::InstanceConfig;
use crate::protocol::AuthGrant;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health of a session as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// Usable as is
    Fresh,
    /// Idle too long; validate before reuse
    Stale,
    /// Rejected by the endpoint or past its maximum age; re-authenticate
    Invalid,
}

/// Lifetime limits applied to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Idle period after which a session turns stale
    pub idle: Duration,
    /// Age after which a session is re-established regardless of health
    pub max_age: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// One authenticated session, owned by the registry
#[derive(Debug)]
pub struct Session {
    config: Arc<InstanceConfig>,
    grant: AuthGrant,
    generation: u64,
    created_at: Instant,
    last_validated: Instant,
    last_used: Instant,
    invalid: bool,
}

impl Session {
    pub(crate) fn new(config: Arc<InstanceConfig>, grant: AuthGrant, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            config,
            grant,
            generation,
            created_at: now,
            last_validated: now,
            last_used: now,
            invalid: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &Arc<InstanceConfig> {
        &self.config
    }

    pub fn grant(&self) -> &AuthGrant {
        &self.grant
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn last_validated(&self) -> Instant {
        self.last_validated
    }

    /// Health at the current instant
    pub fn health(&self, limits: &SessionLimits) -> SessionHealth {
        if self.invalid || self.created_at.elapsed() >= limits.max_age {
            SessionHealth::Invalid
        } else if self.last_used.elapsed() >= limits.idle {
            SessionHealth::Stale
        } else {
            SessionHealth::Fresh
        }
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn mark_validated(&mut self) {
        let now = Instant::now();
        self.last_validated = now;
        self.last_used = now;
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.invalid = true;
    }

    /// Immutable snapshot for callers
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            config: Arc::clone(&self.config),
            grant: self.grant.clone(),
            generation: self.generation,
        }
    }
}

/// Caller-side snapshot of a session
///
/// Holding a handle does not keep the session alive; the registry may replace
/// it at any time. The generation lets the registry ignore invalidation
/// requests made with an outdated handle.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    config: Arc<InstanceConfig>,
    grant: AuthGrant,
    generation: u64,
}

impl SessionHandle {
    pub fn instance(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn grant(&self) -> &AuthGrant {
        &self.grant
    }

    pub fn uid(&self) -> i64 {
        self.grant.uid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
