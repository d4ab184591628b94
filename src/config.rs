//! Strongly-typed configuration.
//!
//! One record per component, composed into a root [`Config`]. Parsing is
//! strict (`deny_unknown_fields` everywhere) and validation runs eagerly:
//! the container refuses to build from a config that hasn't passed
//! [`Config::validate`]. Environment variables with the `SWITCHYARD_`
//! prefix override file values after load, before validation.

use crate::breaker::BreakerConfig;
use crate::cache::{CacheOptions, FingerprintOptions};
use crate::credentials::{CredentialSpec, RotationStrategy};
use crate::pool::PoolConfig;
use crate::rate_limit::RateLimitRule;
use crate::request::Target;
use crate::sequential::{QueueMode, SequentialSettings};
use crate::session::SessionConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// The env-override prefix; see [`Config::apply_env_overrides`] for the
/// recognized keys.
pub const ENV_PREFIX: &str = "SWITCHYARD_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid environment override {key}={value}")]
    Env { key: String, value: String },
    #[error(transparent)]
    Disk(#[from] crate::cache::DiskError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub cache: CacheSection,
    pub credentials: CredentialSection,
    pub connection_pool: ConnectionPoolSection,
    pub sequential: SequentialSection,
    pub failover: FailoverSection,
    pub rate_limit: RateLimitSection,
    pub session: SessionSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    pub enabled: bool,
    pub memory: MemorySection,
    pub kv: KvSection,
    pub disk: DiskSection,
    pub fingerprint: FingerprintOptions,
    pub semantic: SemanticSection,
    pub invalidation: InvalidationSection,
    pub single_flight_wait_ms: u64,
    pub flight_retry_quota: u32,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            memory: MemorySection::default(),
            kv: KvSection::default(),
            disk: DiskSection::default(),
            fingerprint: FingerprintOptions::default(),
            semantic: SemanticSection::default(),
            invalidation: InvalidationSection::default(),
            single_flight_wait_ms: 30_000,
            flight_retry_quota: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemorySection {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self { max_entries: 1_000, ttl_ms: 3_600_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KvSection {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub ttl_ms: u64,
    /// Opaque credential for the KV backend, passed through to the injected
    /// store by the embedding application.
    pub credential: Option<String>,
}

impl Default for KvSection {
    fn default() -> Self {
        Self { enabled: false, endpoint: None, ttl_ms: 3_600_000, credential: None }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiskSection {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_bytes: u64,
    pub ttl_ms: u64,
    pub spill_threshold_bytes: u64,
}

impl Default for DiskSection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("cache"),
            max_bytes: 256 * 1024 * 1024,
            ttl_ms: 24 * 3_600_000,
            spill_threshold_bytes: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SemanticSection {
    pub enabled: bool,
    pub threshold: f64,
    pub max_comparisons: usize,
}

impl Default for SemanticSection {
    fn default() -> Self {
        Self { enabled: false, threshold: 0.85, max_comparisons: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InvalidationSection {
    /// Patterns invalidated at startup.
    pub patterns: Vec<String>,
    pub ttl_variance_ms: u64,
}

impl Default for InvalidationSection {
    fn default() -> Self {
        Self { patterns: Vec::new(), ttl_variance_ms: 30_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CredentialSection {
    pub enabled: bool,
    pub strategy: RotationStrategy,
    pub health_check_interval_ms: u64,
    pub providers: HashMap<String, ProviderKeysSection>,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RotationStrategy::RoundRobin,
            health_check_interval_ms: 30_000,
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderKeysSection {
    pub strategy: Option<RotationStrategy>,
    pub keys: Vec<CredentialSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionPoolSection {
    pub max_sockets: usize,
    pub max_free_sockets: usize,
    pub idle_timeout_ms: u64,
    pub keep_alive_ms: u64,
    pub max_lifetime_ms: u64,
    pub capacity_per_connection: u32,
    pub acquire_timeout_ms: u64,
    pub sticky_load_factor: f64,
}

impl Default for ConnectionPoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_sockets: pool.max_sockets,
            max_free_sockets: pool.max_free_sockets,
            idle_timeout_ms: pool.idle_timeout.as_millis() as u64,
            keep_alive_ms: pool.keep_alive.as_millis() as u64,
            max_lifetime_ms: pool.max_lifetime.as_millis() as u64,
            capacity_per_connection: pool.capacity_per_connection,
            acquire_timeout_ms: pool.acquire_timeout.as_millis() as u64,
            sticky_load_factor: pool.sticky_load_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SequentialSection {
    pub enabled: bool,
    pub mode: QueueMode,
    pub max_queue: usize,
    pub queue_timeout_ms: u64,
    pub keep_alive: bool,
    pub reuse_window_ms: u64,
    pub providers: HashMap<String, QueueMode>,
}

impl Default for SequentialSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: QueueMode::Normal,
            max_queue: 100,
            queue_timeout_ms: 60_000,
            keep_alive: true,
            reuse_window_ms: 10,
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FailoverSection {
    pub enabled: bool,
    /// Ordered chain; the first element is the primary.
    pub targets: Vec<String>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub breaker: BreakerSection,
    pub health_check: HealthCheckSection,
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: Vec::new(),
            max_retries: 3,
            retry_base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            request_timeout_ms: 120_000,
            breaker: BreakerSection::default(),
            health_check: HealthCheckSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub window_ms: u64,
    pub half_open_max: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            success_threshold: breaker.success_threshold,
            reset_timeout_ms: breaker.reset_timeout.as_millis() as u64,
            window_ms: breaker.window.as_millis() as u64,
            half_open_max: breaker.half_open_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthCheckSection {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub probe_endpoint: Option<String>,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self { enabled: false, interval_ms: 30_000, timeout_ms: 5_000, probe_endpoint: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitSection {
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionSection {
    pub inactivity_timeout_ms: u64,
    pub max_fallbacks: usize,
    pub sticky: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            inactivity_timeout_ms: session.inactivity_timeout.as_millis() as u64,
            max_fallbacks: session.max_fallbacks,
            sticky: session.sticky_by_default,
        }
    }
}

impl Config {
    /// Parse from JSON, rejecting unknown keys.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply recognized `SWITCHYARD_*` environment overrides on top of the
    /// loaded values. The convention follows the config path: booleans take
    /// `true`/`false`/`1`/`0`, integers are decimal.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_bool("SWITCHYARD_CACHE_ENABLED", &mut self.cache.enabled)?;
        override_num("SWITCHYARD_CACHE_MEMORY_MAX_ENTRIES", &mut self.cache.memory.max_entries)?;
        override_num("SWITCHYARD_CACHE_MEMORY_TTL_MS", &mut self.cache.memory.ttl_ms)?;
        override_bool("SWITCHYARD_CACHE_KV_ENABLED", &mut self.cache.kv.enabled)?;
        override_bool("SWITCHYARD_CACHE_DISK_ENABLED", &mut self.cache.disk.enabled)?;
        override_num("SWITCHYARD_CACHE_DISK_MAX_BYTES", &mut self.cache.disk.max_bytes)?;
        if let Ok(path) = std::env::var("SWITCHYARD_CACHE_DISK_PATH") {
            self.cache.disk.path = PathBuf::from(path);
        }
        override_bool("SWITCHYARD_CACHE_SEMANTIC_ENABLED", &mut self.cache.semantic.enabled)?;

        override_bool("SWITCHYARD_CREDENTIALS_ENABLED", &mut self.credentials.enabled)?;

        override_num("SWITCHYARD_POOL_MAX_SOCKETS", &mut self.connection_pool.max_sockets)?;
        override_num("SWITCHYARD_POOL_IDLE_TIMEOUT_MS", &mut self.connection_pool.idle_timeout_ms)?;

        override_bool("SWITCHYARD_SEQUENTIAL_ENABLED", &mut self.sequential.enabled)?;
        if let Ok(value) = std::env::var("SWITCHYARD_SEQUENTIAL_MODE") {
            self.sequential.mode = match value.as_str() {
                "normal" => QueueMode::Normal,
                "sequential" => QueueMode::Sequential,
                _ => {
                    return Err(ConfigError::Env {
                        key: "SWITCHYARD_SEQUENTIAL_MODE".into(),
                        value,
                    })
                }
            };
        }
        override_num("SWITCHYARD_SEQUENTIAL_MAX_QUEUE", &mut self.sequential.max_queue)?;

        override_bool("SWITCHYARD_FAILOVER_ENABLED", &mut self.failover.enabled)?;
        override_num("SWITCHYARD_FAILOVER_MAX_RETRIES", &mut self.failover.max_retries)?;
        override_num(
            "SWITCHYARD_FAILOVER_REQUEST_TIMEOUT_MS",
            &mut self.failover.request_timeout_ms,
        )?;
        Ok(())
    }

    /// Reject configurations that cannot possibly work before anything is
    /// built from them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for spec in &self.failover.targets {
            Target::parse(spec)
                .map_err(|e| ConfigError::Invalid(format!("failover.targets: {e}")))?;
        }
        if self.failover.max_retries == 0 {
            return Err(ConfigError::Invalid("failover.max_retries must be > 0".into()));
        }
        if self.failover.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "failover.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.failover.breaker.failure_threshold == 0
            || self.failover.breaker.success_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "failover.breaker thresholds must be > 0".into(),
            ));
        }
        if self.connection_pool.max_sockets == 0 {
            return Err(ConfigError::Invalid("connection_pool.max_sockets must be > 0".into()));
        }
        if !(0.0 < self.connection_pool.sticky_load_factor
            && self.connection_pool.sticky_load_factor <= 1.0)
        {
            return Err(ConfigError::Invalid(
                "connection_pool.sticky_load_factor must be in (0, 1]".into(),
            ));
        }
        if self.cache.semantic.enabled
            && !(0.0 < self.cache.semantic.threshold && self.cache.semantic.threshold <= 1.0)
        {
            return Err(ConfigError::Invalid(
                "cache.semantic.threshold must be in (0, 1]".into(),
            ));
        }
        if self.cache.disk.enabled && self.cache.disk.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache.disk.path must not be empty".into()));
        }
        if self.cache.kv.enabled && self.cache.kv.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "cache.kv.endpoint is required when the kv tier is enabled".into(),
            ));
        }
        if self.sequential.max_queue == 0 {
            return Err(ConfigError::Invalid("sequential.max_queue must be > 0".into()));
        }
        for rule in &self.rate_limit.rules {
            if rule.limit == 0 || rule.window_ms == 0 {
                return Err(ConfigError::Invalid(
                    "rate_limit rules need limit > 0 and window_ms > 0".into(),
                ));
            }
            if !(0.0 < rule.soft_threshold && rule.soft_threshold <= 1.0) {
                return Err(ConfigError::Invalid(
                    "rate_limit soft_threshold must be in (0, 1]".into(),
                ));
            }
        }
        Ok(())
    }

    // Assemblers into the component-level records.

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            enabled: self.cache.enabled,
            memory_max_entries: self.cache.memory.max_entries,
            memory_ttl: Duration::from_millis(self.cache.memory.ttl_ms),
            kv_enabled: self.cache.kv.enabled,
            kv_ttl: Duration::from_millis(self.cache.kv.ttl_ms),
            disk_enabled: self.cache.disk.enabled,
            disk_path: self.cache.disk.path.clone(),
            disk_max_bytes: self.cache.disk.max_bytes,
            disk_ttl: Duration::from_millis(self.cache.disk.ttl_ms),
            disk_spill_threshold: self.cache.disk.spill_threshold_bytes,
            semantic_enabled: self.cache.semantic.enabled,
            semantic_threshold: self.cache.semantic.threshold,
            semantic_max_comparisons: self.cache.semantic.max_comparisons,
            ttl_variance: Duration::from_millis(self.cache.invalidation.ttl_variance_ms),
            single_flight_wait: Duration::from_millis(self.cache.single_flight_wait_ms),
            flight_retry_quota: self.cache.flight_retry_quota,
            degradation_log_window: Duration::from_secs(60),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sockets: self.connection_pool.max_sockets,
            max_free_sockets: self.connection_pool.max_free_sockets,
            idle_timeout: Duration::from_millis(self.connection_pool.idle_timeout_ms),
            keep_alive: Duration::from_millis(self.connection_pool.keep_alive_ms),
            max_lifetime: Duration::from_millis(self.connection_pool.max_lifetime_ms),
            capacity_per_connection: self.connection_pool.capacity_per_connection,
            acquire_timeout: Duration::from_millis(self.connection_pool.acquire_timeout_ms),
            sticky_load_factor: self.connection_pool.sticky_load_factor,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failover.breaker.failure_threshold,
            success_threshold: self.failover.breaker.success_threshold,
            reset_timeout: Duration::from_millis(self.failover.breaker.reset_timeout_ms),
            window: Duration::from_millis(self.failover.breaker.window_ms),
            half_open_max: self.failover.breaker.half_open_max,
        }
    }

    pub fn sequential_settings(&self) -> SequentialSettings {
        SequentialSettings {
            default_mode: if self.sequential.enabled {
                self.sequential.mode
            } else {
                QueueMode::Normal
            },
            overrides: self.sequential.providers.clone(),
            max_queue: self.sequential.max_queue,
            queue_timeout: Duration::from_millis(self.sequential.queue_timeout_ms),
            reuse_window: Duration::from_millis(self.sequential.reuse_window_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_millis(self.session.inactivity_timeout_ms),
            max_fallbacks: self.session.max_fallbacks,
            sticky_by_default: self.session.sticky,
        }
    }

    /// Declared failover chain, primary first.
    pub fn failover_targets(&self) -> Vec<Target> {
        self.failover
            .targets
            .iter()
            .filter_map(|spec| Target::parse(spec).ok())
            .collect()
    }
}

fn override_bool(key: &str, slot: &mut bool) -> Result<(), ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.as_str() {
            "true" | "1" => {
                *slot = true;
                Ok(())
            }
            "false" | "0" => {
                *slot = false;
                Ok(())
            }
            _ => Err(ConfigError::Env { key: key.to_string(), value }),
        },
        Err(_) => Ok(()),
    }
}

fn override_num<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => {
                *slot = parsed;
                Ok(())
            }
            Err(_) => Err(ConfigError::Env { key: key.to_string(), value }),
        },
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn parses_a_representative_config() {
        let raw = r#"{
            "cache": {
                "enabled": true,
                "memory": { "max_entries": 500, "ttl_ms": 60000 },
                "semantic": { "enabled": true, "threshold": 0.9, "max_comparisons": 10 }
            },
            "credentials": {
                "strategy": "least_loaded",
                "providers": {
                    "openrouter": {
                        "keys": [
                            { "key": "sk-1", "requests_per_minute": 60 },
                            { "key": "sk-2", "priority": 5 }
                        ]
                    }
                }
            },
            "failover": {
                "targets": ["openrouter,anthropic/claude-3.5-sonnet", "deepseek,deepseek-chat"],
                "max_retries": 2
            },
            "sequential": { "mode": "sequential", "providers": { "deepseek": "normal" } }
        }"#;

        let config = Config::from_json_str(raw).expect("parses");
        config.validate().expect("validates");

        assert_eq!(config.cache.memory.max_entries, 500);
        assert_eq!(config.credentials.strategy, RotationStrategy::LeastLoaded);
        assert_eq!(config.credentials.providers["openrouter"].keys.len(), 2);
        assert_eq!(config.failover_targets().len(), 2);
        assert_eq!(config.failover_targets()[0].provider, "openrouter");
        assert_eq!(config.sequential_settings().mode_for("deepseek"), QueueMode::Normal);
        assert_eq!(config.sequential_settings().mode_for("openrouter"), QueueMode::Sequential);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{ "cache": { "enabled": true, "typo_field": 1 } }"#;
        assert!(matches!(Config::from_json_str(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn invalid_target_spec_fails_validation() {
        let raw = r#"{ "failover": { "targets": [",missing-provider"] } }"#;
        let config = Config::from_json_str(raw).expect("parse is lexical only");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_retries_fails_validation() {
        let raw = r#"{ "failover": { "max_retries": 0 } }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn semantic_threshold_bounds_are_enforced() {
        let raw = r#"{ "cache": { "semantic": { "enabled": true, "threshold": 1.5 } } }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn kv_tier_requires_an_endpoint() {
        let raw = r#"{ "cache": { "kv": { "enabled": true } } }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_take_effect() {
        // Env vars are process-global; keep this test self-contained by
        // using keys no other test touches.
        std::env::set_var("SWITCHYARD_CACHE_MEMORY_MAX_ENTRIES", "42");
        std::env::set_var("SWITCHYARD_SEQUENTIAL_MODE", "sequential");
        let mut config = Config::default();
        config.apply_env_overrides().expect("overrides apply");
        std::env::remove_var("SWITCHYARD_CACHE_MEMORY_MAX_ENTRIES");
        std::env::remove_var("SWITCHYARD_SEQUENTIAL_MODE");

        assert_eq!(config.cache.memory.max_entries, 42);
        assert_eq!(config.sequential.mode, QueueMode::Sequential);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        std::env::set_var("SWITCHYARD_FAILOVER_MAX_RETRIES", "lots");
        let mut config = Config::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("SWITCHYARD_FAILOVER_MAX_RETRIES");
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn disabled_sequential_section_forces_normal_mode() {
        let raw = r#"{ "sequential": { "enabled": false, "mode": "sequential" } }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert_eq!(config.sequential_settings().default_mode, QueueMode::Normal);
    }
}
