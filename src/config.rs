/*!
 * Configuration types for the ERP gateway
 */

use crate::error::{GatewayError, Result};
use erp_gateway_core_resilience::{BackoffStrategy, RetryPolicy};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the instance used when nothing else is configured
pub const DEFAULT_INSTANCE: &str = "default";

/// Read methods whose results are cached unless configured otherwise
pub const DEFAULT_CACHEABLE_METHODS: &[&str] = &[
    "search",
    "read",
    "search_read",
    "search_count",
    "fields_get",
    "name_search",
    "read_group",
];

/// Connection settings for one named ERP endpoint
///
/// Immutable once registered; a changed definition replaces the entry.
#[derive(Clone, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance name (taken from the table key in TOML)
    #[serde(skip)]
    pub name: String,

    /// Base URL, normalized to carry a scheme and no trailing slash
    pub url: String,

    /// Database name on the endpoint
    #[serde(alias = "db")]
    pub database: String,

    pub username: String,

    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Verify TLS certificates
    #[serde(default = "default_true", alias = "verify_tls")]
    pub verify_ssl: bool,

    /// Cache read results for this instance
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Default cache TTL in seconds (0 disables caching)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("verify_ssl", &self.verify_ssl)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl InstanceConfig {
    /// Create a config with default timeout, TLS and cache settings
    pub fn new(
        name: impl Into<String>,
        url: &str,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: normalize_url(url),
            database: database.into(),
            username: username.into(),
            password: SecretString::new(password.into().into_boxed_str()),
            timeout: default_timeout(),
            verify_ssl: true,
            cache_enabled: true,
            cache_ttl: default_cache_ttl(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    pub fn with_cache(mut self, enabled: bool, ttl_secs: u64) -> Self {
        self.cache_enabled = enabled;
        self.cache_ttl = ttl_secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Effective cache TTL: zero when caching is disabled
    pub fn cache_ttl(&self) -> Duration {
        if self.cache_enabled {
            Duration::from_secs(self.cache_ttl)
        } else {
            Duration::ZERO
        }
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::config("instance name must not be empty"));
        }
        for (field, value) in [
            ("url", &self.url),
            ("database", &self.database),
            ("username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::config(format!(
                    "instance '{}': {} must not be empty",
                    self.name, field
                )));
            }
        }
        if self.timeout == 0 {
            return Err(GatewayError::config(format!(
                "instance '{}': timeout must be at least 1 second",
                self.name
            )));
        }
        Ok(())
    }

    /// Build a config from environment variables
    ///
    /// Looks for `{NAME}_ODOO_URL`, `_DB`, `_USERNAME` and `_PASSWORD`; the
    /// `default` instance also accepts the unprefixed `ODOO_*` set. Returns
    /// `Ok(None)` when the required variables are not all present.
    pub fn from_env(name: &str, env: &EnvSource) -> Result<Option<Self>> {
        let prefixed = format!("{}_ODOO", env_prefix(name));
        if let Some(config) = Self::from_env_prefix(name, &prefixed, env)? {
            return Ok(Some(config));
        }
        if name == DEFAULT_INSTANCE {
            return Self::from_env_prefix(name, "ODOO", env);
        }
        Ok(None)
    }

    fn from_env_prefix(name: &str, prefix: &str, env: &EnvSource) -> Result<Option<Self>> {
        let var = |suffix: &str| env.get(&format!("{}_{}", prefix, suffix));

        let (Some(url), Some(db), Some(username), Some(password)) =
            (var("URL"), var("DB"), var("USERNAME"), var("PASSWORD"))
        else {
            return Ok(None);
        };

        let mut config = InstanceConfig::new(name, &url, db, username, password);
        if let Some(timeout) = var("TIMEOUT") {
            config.timeout = parse_env_number(prefix, "TIMEOUT", &timeout)?;
        }
        if let Some(verify) = var("VERIFY_SSL") {
            config.verify_ssl = parse_env_flag(&verify);
        }
        if let Some(enabled) = var("CACHE_ENABLED") {
            config.cache_enabled = parse_env_flag(&enabled);
        }
        if let Some(ttl) = var("CACHE_TTL") {
            config.cache_ttl = parse_env_number(prefix, "CACHE_TTL", &ttl)?;
        }
        config.validate()?;
        Ok(Some(config))
    }
}

/// Source of environment variables for instance fallback
///
/// Tests inject a fixed map instead of touching the process environment.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// Read the real process environment
    #[default]
    Process,
    /// Read from a fixed map
    Fixed(HashMap<String, String>),
    /// No environment fallback at all
    Disabled,
}

impl EnvSource {
    pub fn fixed<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        EnvSource::Fixed(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            EnvSource::Process => std::env::var(key).ok(),
            EnvSource::Fixed(vars) => vars.get(key).cloned(),
            EnvSource::Disabled => None,
        }
    }

    fn keys(&self) -> Vec<String> {
        match self {
            EnvSource::Process => std::env::vars().map(|(k, _)| k).collect(),
            EnvSource::Fixed(vars) => vars.keys().cloned().collect(),
            EnvSource::Disabled => Vec::new(),
        }
    }

    /// Names of instances fully defined in the environment (lowercased)
    pub fn discover_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .keys()
            .into_iter()
            .filter_map(|key| key.strip_suffix("_ODOO_URL").map(str::to_string))
            .filter(|prefix| !prefix.is_empty())
            .filter(|prefix| {
                ["DB", "USERNAME", "PASSWORD"]
                    .iter()
                    .all(|s| self.get(&format!("{}_ODOO_{}", prefix, s)).is_some())
            })
            .map(|prefix| prefix.to_lowercase())
            .collect();

        let has_default = ["URL", "DB", "USERNAME", "PASSWORD"]
            .iter()
            .all(|s| self.get(&format!("ODOO_{}", s)).is_some());
        if has_default {
            names.push(DEFAULT_INSTANCE.to_string());
        }

        names.sort();
        names.dedup();
        names
    }
}

/// Top-level gateway configuration, usually loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Instance used when a call names none
    #[serde(default = "default_instance_name")]
    pub default_instance: String,

    /// Named instance definitions
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_instance: default_instance_name(),
            instances: BTreeMap::new(),
            retry: RetrySettings::default(),
            batch: BatchSettings::default(),
            session: SessionSettings::default(),
            cache: CacheSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: GatewayConfig = toml::from_str(contents)?;
        config.finalize()?;
        Ok(config)
    }

    /// Fill instance names from table keys, normalize URLs and validate
    fn finalize(&mut self) -> Result<()> {
        for (name, instance) in self.instances.iter_mut() {
            instance.name = name.clone();
            instance.url = normalize_url(&instance.url);
            instance.validate()?;
        }
        self.retry.to_policy()?;
        self.batch.chunk_policy()?;
        if self.batch.chunk_size == 0 {
            return Err(GatewayError::config("batch.chunk_size must be at least 1"));
        }
        Ok(())
    }

    /// Instance definitions in name order
    pub fn instance_configs(&self) -> Vec<InstanceConfig> {
        self.instances.values().cloned().collect()
    }
}

/// Call-level retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Total attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// fixed, linear, exponential or exponential-jitter
    #[serde(default = "default_backoff")]
    pub backoff: String,

    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: default_backoff(),
            jitter_factor: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        let backoff: BackoffStrategy = self
            .backoff
            .parse()
            .map_err(|e| GatewayError::config(format!("retry.backoff: {}", e)))?;
        let policy = RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff,
            jitter_factor: self.jitter_factor,
        };
        policy
            .validate()
            .map_err(|e| GatewayError::config(format!("retry: {}", e)))?;
        Ok(policy)
    }
}

/// Batch executor defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker count (0 = derive from CPU count)
    #[serde(default)]
    pub workers: usize,

    /// Reassemble chunk payloads in submission order
    #[serde(default)]
    pub ordered: bool,

    /// Chunk-level attempts after the call-level budget is exhausted
    #[serde(default = "default_chunk_attempts")]
    pub chunk_max_attempts: u32,

    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_initial_delay_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: 0,
            ordered: false,
            chunk_max_attempts: default_chunk_attempts(),
            chunk_initial_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl BatchSettings {
    pub fn chunk_policy(&self) -> Result<RetryPolicy> {
        let policy = RetryPolicy {
            max_attempts: self.chunk_max_attempts,
            initial_delay: Duration::from_millis(self.chunk_initial_delay_ms),
            ..RetryPolicy::chunk_default()
        };
        policy
            .validate()
            .map_err(|e| GatewayError::config(format!("batch: {}", e)))?;
        Ok(policy)
    }
}

/// Session lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Idle seconds after which a session is validated before reuse
    #[serde(default = "default_idle_secs")]
    pub idle_validate_secs: u64,

    /// Seconds after which a session is re-authenticated regardless of health
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_validate_secs: default_idle_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

/// Cache settings shared by all instances
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    /// Seconds between background sweeps of expired entries (0 = never)
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,

    /// Methods whose results may be cached
    #[serde(default = "default_cacheable_methods")]
    pub cacheable_methods: Vec<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_secs(),
            cacheable_methods: default_cacheable_methods(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: LogLevel,

    /// JSON log file path (None = stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,

    /// Calls slower than this are logged as warnings
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_ms: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            file: None,
            verbose: false,
            slow_call_ms: default_slow_call_ms(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Prepend `http://` when no scheme is given and strip the trailing slash
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() {
        return String::new();
    }
    let with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };
    with_scheme.trim_end_matches('/').to_string()
}

fn env_prefix(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

fn parse_env_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_env_number(prefix: &str, suffix: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        GatewayError::config(format!(
            "{}_{} must be a whole number, got '{}'",
            prefix, suffix, value
        ))
    })
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(SecretString::new(s.into_boxed_str()))
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_instance_name() -> String {
    DEFAULT_INSTANCE.to_string()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff() -> String {
    "exponential-jitter".to_string()
}

fn default_jitter() -> f64 {
    0.3
}

fn default_chunk_size() -> usize {
    100
}

fn default_chunk_attempts() -> u32 {
    3
}

fn default_chunk_delay_ms() -> u64 {
    1_000
}

fn default_idle_secs() -> u64 {
    300
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_cacheable_methods() -> Vec<String> {
    DEFAULT_CACHEABLE_METHODS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_slow_call_ms() -> u64 {
    1_000
}
