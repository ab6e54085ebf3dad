//! Configuration types

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CachetError, CachetResult, ConfigError};
use crate::key::validate_segment;

/// How invalidation propagates between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Long-running processes: local memo layer plus pub/sub sync.
    #[default]
    Server,
    /// Short-lived executions: version counters, no local state.
    Serverless,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "serverless" => Ok(Self::Serverless),
            other => Err(ConfigError::InvalidValue {
                field: "mode".to_string(),
                value: other.to_string(),
                reason: "expected 'server' or 'serverless'".to_string(),
            }),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before a probe is allowed.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 3,
        }
    }
}

/// In-process memo layer settings (server mode only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    /// Upper bound on how long a local copy lives. `None` follows the entry TTL.
    pub ttl: Option<Duration>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1_000,
            ttl: None,
        }
    }
}

/// Registry-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Namespace for every key this registry writes.
    pub prefix: String,
    pub mode: Mode,
    pub breaker: BreakerConfig,
    pub local: LocalCacheConfig,
    /// Broadcast invalidations to other server-mode instances.
    pub sync_enabled: bool,
    /// Lifetime of version counters (serverless mode).
    pub version_ttl: Duration,
    /// Default for per-entry fetch deduplication.
    pub dedupe: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "cache".to_string(),
            mode: Mode::Server,
            breaker: BreakerConfig::default(),
            local: LocalCacheConfig::default(),
            sync_enabled: true,
            version_ttl: Duration::from_secs(24 * 60 * 60),
            dedupe: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_local(mut self, local: LocalCacheConfig) -> Self {
        self.local = local;
        self
    }

    pub fn without_local(mut self) -> Self {
        self.local.enabled = false;
        self
    }

    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    pub fn with_version_ttl(mut self, ttl: Duration) -> Self {
        self.version_ttl = ttl;
        self
    }

    pub fn with_dedupe(mut self, enabled: bool) -> Self {
        self.dedupe = enabled;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CACHET_PREFIX`: key namespace (default: cache)
    /// - `CACHET_MODE`: `server` or `serverless` (default: server)
    /// - `CACHET_BREAKER_THRESHOLD`: failures before opening (default: 5)
    /// - `CACHET_BREAKER_RESET_MS`: cool-down in milliseconds (default: 30000)
    /// - `CACHET_BREAKER_HALF_OPEN`: successes before closing (default: 3)
    /// - `CACHET_LOCAL_ENABLED`: enable the local layer (default: true)
    /// - `CACHET_LOCAL_CAPACITY`: local layer capacity (default: 1000)
    /// - `CACHET_LOCAL_TTL_MS`: local TTL cap in milliseconds (default: unset)
    /// - `CACHET_SYNC_ENABLED`: broadcast invalidations (default: true)
    /// - `CACHET_VERSION_TTL_SECS`: version counter TTL (default: 86400)
    /// - `CACHET_DEDUPE`: deduplicate concurrent fetches (default: true)
    ///
    /// Unparseable values are reported rather than silently replaced.
    pub fn from_env() -> CachetResult<Self> {
        let defaults = Self::default();

        let mode = match std::env::var("CACHET_MODE") {
            Ok(raw) => raw.parse::<Mode>().map_err(CachetError::from)?,
            Err(_) => defaults.mode,
        };

        let config = Self {
            prefix: std::env::var("CACHET_PREFIX").unwrap_or(defaults.prefix),
            mode,
            breaker: BreakerConfig {
                failure_threshold: env_parse("CACHET_BREAKER_THRESHOLD")?
                    .unwrap_or(defaults.breaker.failure_threshold),
                reset_timeout: env_parse::<u64>("CACHET_BREAKER_RESET_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.breaker.reset_timeout),
                half_open_requests: env_parse("CACHET_BREAKER_HALF_OPEN")?
                    .unwrap_or(defaults.breaker.half_open_requests),
            },
            local: LocalCacheConfig {
                enabled: env_parse("CACHET_LOCAL_ENABLED")?.unwrap_or(defaults.local.enabled),
                capacity: env_parse("CACHET_LOCAL_CAPACITY")?.unwrap_or(defaults.local.capacity),
                ttl: env_parse::<u64>("CACHET_LOCAL_TTL_MS")?
                    .map(Duration::from_millis)
                    .or(defaults.local.ttl),
            },
            sync_enabled: env_parse("CACHET_SYNC_ENABLED")?.unwrap_or(defaults.sync_enabled),
            version_ttl: env_parse::<u64>("CACHET_VERSION_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.version_ttl),
            dedupe: env_parse("CACHET_DEDUPE")?.unwrap_or(defaults.dedupe),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - prefix is a legal key segment
    /// - breaker thresholds and cool-down are positive
    /// - local capacity is positive when the local layer is enabled
    /// - version TTL is positive
    pub fn validate(&self) -> CachetResult<()> {
        if let Err(e) = validate_segment("prefix", &self.prefix) {
            return Err(invalid("prefix", &self.prefix, &e.to_string()));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid(
                "breaker.failure_threshold",
                &self.breaker.failure_threshold.to_string(),
                "failure_threshold must be greater than 0",
            ));
        }

        if self.breaker.half_open_requests == 0 {
            return Err(invalid(
                "breaker.half_open_requests",
                &self.breaker.half_open_requests.to_string(),
                "half_open_requests must be greater than 0",
            ));
        }

        if self.breaker.reset_timeout.is_zero() {
            return Err(invalid(
                "breaker.reset_timeout",
                &format!("{:?}", self.breaker.reset_timeout),
                "reset_timeout must be positive",
            ));
        }

        if self.local.enabled && self.local.capacity == 0 {
            return Err(invalid(
                "local.capacity",
                "0",
                "capacity must be greater than 0 when the local cache is enabled",
            ));
        }

        if self.version_ttl.is_zero() {
            return Err(invalid(
                "version_ttl",
                &format!("{:?}", self.version_ttl),
                "version_ttl must be positive",
            ));
        }

        Ok(())
    }

    /// Whether this configuration runs a local memo layer.
    pub fn uses_local_cache(&self) -> bool {
        self.mode == Mode::Server && self.local.enabled
    }

    /// Whether this configuration broadcasts invalidations.
    pub fn uses_change_bus(&self) -> bool {
        self.mode == Mode::Server && self.sync_enabled
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> CachetError {
    CachetError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn env_parse<V: FromStr>(var: &str) -> CachetResult<Option<V>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<V>()
            .map(Some)
            .map_err(|_| invalid(var, &raw, "could not be parsed")),
        Err(_) => Ok(None),
    }
}

// =============================================================================
// TESTS
// =============================================================================
