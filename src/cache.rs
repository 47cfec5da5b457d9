//! Process-wide TTL cache for read results
//!
//! Keys are fingerprints of (instance, model, method, canonical arguments).
//! Expiry is lazy: an entry is never returned once `now - stored_at > ttl`,
//! whether or not a sweep has reclaimed it yet.

use crate::config::{InstanceConfig, DEFAULT_CACHEABLE_METHODS};
use crate::protocol::{RemoteCall, RpcArgs};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Domain operators that make a domain more than an implicit AND of leaves
const DOMAIN_OPERATORS: &[&str] = &["&", "|", "!"];

/// Methods whose first positional argument is a search domain
const DOMAIN_METHODS: &[&str] = &["search", "search_read", "search_count", "read_group"];

/// Deterministic cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub instance: String,
    pub model: String,
    pub method: String,
    /// Hex digest of the canonical argument set
    pub digest: String,
}

impl Fingerprint {
    /// Fingerprint of `call` against `instance`
    pub fn of(instance: &str, call: &RemoteCall) -> Self {
        let canonical = canonical_args(&call.method, &call.args);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let hash = blake3::hash(&bytes);

        Self {
            instance: instance.to_string(),
            model: call.model.clone(),
            method: call.method.clone(),
            digest: hex::encode(&hash.as_bytes()[..16]),
        }
    }
}

/// Canonical form of call arguments
///
/// Implicit-AND domains have their leaves sorted, field lists are sorted and
/// deduplicated. Keyword arguments are already key-ordered by `serde_json`.
/// Offset, limit and order are kept as given.
pub fn canonical_args(method: &str, args: &RpcArgs) -> Value {
    let mut positional = args.args.clone();
    let mut kwargs = args.kwargs.clone();

    if DOMAIN_METHODS.contains(&method) {
        if let Some(domain) = positional.get_mut(0) {
            canonicalize_domain(domain);
        }
    }
    if let Some(domain) = kwargs.get_mut("domain") {
        canonicalize_domain(domain);
    }

    if matches!(method, "read" | "search_read") {
        if let Some(fields) = positional.get_mut(1) {
            canonicalize_fields(fields);
        }
    }
    for key in ["fields", "attributes"] {
        if let Some(fields) = kwargs.get_mut(key) {
            canonicalize_fields(fields);
        }
    }

    serde_json::json!({ "args": positional, "kwargs": kwargs })
}

fn canonicalize_domain(domain: &mut Value) {
    let Value::Array(terms) = domain else {
        return;
    };
    let has_operator = terms
        .iter()
        .any(|term| term.as_str().is_some_and(|s| DOMAIN_OPERATORS.contains(&s)));
    if !has_operator && terms.iter().all(Value::is_array) {
        terms.sort_by_cached_key(|term| term.to_string());
    }
}

fn canonicalize_fields(fields: &mut Value) {
    let Value::Array(names) = fields else {
        return;
    };
    if names.iter().all(Value::is_string) {
        names.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        names.dedup();
    }
}

/// Per-instance caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub default_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            default_ttl: Duration::ZERO,
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            enabled: config.cache_enabled && config.cache_ttl > 0,
            default_ttl: config.cache_ttl(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub entries: usize,
    pub invalidations: u64,
}

/// Point in the cache's invalidation history
///
/// Taken before a remote read; a result stored with [`ResultCache::put_since`]
/// is dropped if its model was invalidated after this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheEpoch(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    All,
    Instance(String),
    Model(String, String),
}

#[derive(Default)]
struct Store {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Bumped by every invalidation
    clock: u64,
    /// Clock value of the latest invalidation per scope
    marks: HashMap<Scope, u64>,
}

impl Store {
    fn invalidated_since(&self, key: &Fingerprint, epoch: CacheEpoch) -> bool {
        let scopes = [
            Scope::All,
            Scope::Instance(key.instance.clone()),
            Scope::Model(key.instance.clone(), key.model.clone()),
        ];
        scopes
            .iter()
            .any(|scope| self.marks.get(scope).is_some_and(|&mark| mark > epoch.0))
    }
}

/// Shared read-result cache
pub struct ResultCache {
    store: RwLock<Store>,
    policies: RwLock<HashMap<String, CachePolicy>>,
    cacheable: HashSet<String>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHEABLE_METHODS.iter().map(|m| m.to_string()))
    }
}

impl ResultCache {
    /// Create a cache that accepts results of the given methods
    pub fn new(cacheable_methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            policies: RwLock::new(HashMap::new()),
            cacheable: cacheable_methods.into_iter().collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn is_cacheable(&self, method: &str) -> bool {
        self.cacheable.contains(method)
    }

    /// Set the policy of one instance; disabling drops its entries
    pub fn set_policy(&self, instance: &str, policy: CachePolicy) {
        self.policies.write().insert(instance.to_string(), policy);
        if !policy.enabled {
            self.invalidate_instance(instance);
        }
    }

    /// Set the policy only if the instance has none yet
    pub fn ensure_policy(&self, instance: &str, policy: CachePolicy) {
        if self.policies.read().contains_key(instance) {
            return;
        }
        self.policies
            .write()
            .entry(instance.to_string())
            .or_insert(policy);
    }

    pub fn policy(&self, instance: &str) -> CachePolicy {
        self.policies
            .read()
            .get(instance)
            .copied()
            .unwrap_or_default()
    }

    /// Cached value for `key`, or `None` on a miss
    pub fn get(&self, key: &Fingerprint) -> Option<Value> {
        if !self.policy(&key.instance).enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = Instant::now();
        let expired = {
            let store = self.store.read();
            match store.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit: {}.{} on {}", key.model, key.method, key.instance);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut store = self.store.write();
            if store.entries.get(key).is_some_and(|e| e.is_expired(now)) {
                store.entries.remove(key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss: {}.{} on {}", key.model, key.method, key.instance);
        None
    }

    /// Current invalidation epoch
    pub fn epoch(&self) -> CacheEpoch {
        CacheEpoch(self.store.read().clock)
    }

    /// Store `value` for `ttl` (or the instance default)
    ///
    /// A no-op when caching is disabled for the instance or the TTL is zero.
    pub fn put(&self, key: Fingerprint, value: Value, ttl: Option<Duration>) {
        self.insert(key, value, ttl, None);
    }

    /// Like [`put`](Self::put), unless the key's model, instance or the whole
    /// cache was invalidated after `epoch`; returns whether the value was stored
    pub fn put_since(
        &self,
        key: Fingerprint,
        value: Value,
        ttl: Option<Duration>,
        epoch: CacheEpoch,
    ) -> bool {
        self.insert(key, value, ttl, Some(epoch))
    }

    fn insert(
        &self,
        key: Fingerprint,
        value: Value,
        ttl: Option<Duration>,
        epoch: Option<CacheEpoch>,
    ) -> bool {
        let policy = self.policy(&key.instance);
        if !policy.enabled {
            return false;
        }
        let ttl = ttl.unwrap_or(policy.default_ttl);
        if ttl.is_zero() {
            return false;
        }

        let mut store = self.store.write();
        if epoch.is_some_and(|epoch| store.invalidated_since(&key, epoch)) {
            debug!(
                "Dropping result of {}.{} on {}: invalidated while in flight",
                key.model, key.method, key.instance
            );
            return false;
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        store.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    /// Drop every entry of `model` on `instance`; returns how many were removed
    pub fn invalidate_matching(&self, instance: &str, model: &str) -> usize {
        self.remove_where(
            Scope::Model(instance.to_string(), model.to_string()),
            |key| key.instance == instance && key.model == model,
        )
    }

    /// Drop every entry of `instance`
    pub fn invalidate_instance(&self, instance: &str) -> usize {
        self.remove_where(Scope::Instance(instance.to_string()), |key| {
            key.instance == instance
        })
    }

    pub fn clear(&self) -> usize {
        self.remove_where(Scope::All, |_| true)
    }

    fn remove_where(&self, scope: Scope, predicate: impl Fn(&Fingerprint) -> bool) -> usize {
        let mut store = self.store.write();
        store.clock += 1;
        let clock = store.clock;
        store.marks.insert(scope, clock);

        let before = store.entries.len();
        store.entries.retain(|key, _| !predicate(key));
        let removed = before - store.entries.len();
        if removed > 0 {
            self.invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Invalidated {} cache entries", removed);
        }
        removed
    }

    /// Reclaim expired entries; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.write();
        let before = store.entries.len();
        store.entries.retain(|_, entry| !entry.is_expired(now));
        before - store.entries.len()
    }

    /// Sweep periodically until the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!("Cache sweep removed {} expired entries", removed);
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            entries: self.len(),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
