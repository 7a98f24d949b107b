// Configuration for the lane manager and the specialist pool
//
// Durations are stored as millisecond fields so the config reads naturally
// from TOML; accessors return `Duration`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::usage::ScoreWeights;

/// Configuration for the exclusive resource manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Waiters queued at least this long are aged into the most urgent band.
    /// `None` disables aging.
    pub max_wait_ms: Option<u64>,

    /// Queue timeout applied when an acquire call does not set one
    pub default_timeout_ms: Option<u64>,

    /// Lease lifetime applied when an acquire call does not set one
    pub default_lease_ttl_ms: Option<u64>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: Some(30_000), // 30 seconds
            default_timeout_ms: None,
            default_lease_ttl_ms: None,
        }
    }
}

impl LeaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the aging threshold
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait_ms = max_wait.map(duration_ms);
        self
    }

    /// Set the default queue timeout
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout_ms = timeout.map(duration_ms);
        self
    }

    /// Set the default lease lifetime
    pub fn with_default_lease_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_lease_ttl_ms = ttl.map(duration_ms);
        self
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn default_lease_ttl(&self) -> Option<Duration> {
        self.default_lease_ttl_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_lease_ttl_ms == Some(0) {
            return Err(ConfigError::invalid("default_lease_ttl_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// What the pool does when it is full and every entry is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Return `PoolError::Exhausted` immediately
    #[default]
    Fail,
    /// Wait for a slot, bounded by `acquire_timeout_ms` when set
    Block,
}

/// Configuration for the specialist pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard upper bound on cached entries across all types
    pub capacity: usize,

    pub exhaustion_policy: ExhaustionPolicy,

    /// Upper bound on blocking for a slot
    pub acquire_timeout_ms: Option<u64>,

    /// Idle entries older than this are destroyed. `None` keeps them forever.
    pub idle_ttl_ms: Option<u64>,

    /// Per-type idle TTL tiers overriding `idle_ttl_ms`
    pub type_ttl_ms: BTreeMap<String, u64>,

    pub score_weights: ScoreWeights,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            exhaustion_policy: ExhaustionPolicy::Fail,
            acquire_timeout_ms: None,
            idle_ttl_ms: Some(300_000), // 5 minutes
            type_ttl_ms: BTreeMap::new(),
            score_weights: ScoreWeights::default(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl_ms = ttl.map(duration_ms);
        self
    }

    /// Give one specialist type its own idle TTL
    pub fn with_type_ttl(mut self, type_key: impl Into<String>, ttl: Duration) -> Self {
        self.type_ttl_ms.insert(type_key.into(), duration_ms(ttl));
        self
    }

    pub fn with_score_weights(mut self, weights: ScoreWeights) -> Self {
        self.score_weights = weights;
        self
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Idle TTL of `type_key`, falling back to the default tier
    pub fn idle_ttl_for(&self, type_key: &str) -> Option<Duration> {
        self.type_ttl_ms
            .get(type_key)
            .copied()
            .or(self.idle_ttl_ms)
            .map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("pool capacity must be greater than 0"));
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("acquire_timeout_ms must be greater than 0"));
        }
        self.score_weights.validate()
    }
}

/// Logging settings consumed by [`crate::telemetry::init_from_config`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "lanekeeper=debug,info"
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub lease: LeaseConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease.validate()?;
        self.pool.validate()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.lease.max_wait(), Some(Duration::from_secs(30)));
        assert_eq!(config.lease.default_timeout(), None);
        assert_eq!(config.pool.capacity, 8);
        assert_eq!(config.pool.exhaustion_policy, ExhaustionPolicy::Fail);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let pool = PoolConfig::new()
            .with_capacity(2)
            .with_exhaustion_policy(ExhaustionPolicy::Block)
            .with_acquire_timeout(Some(Duration::from_millis(500)))
            .with_idle_ttl(Some(Duration::from_secs(60)))
            .with_type_ttl("reviewer", Duration::from_secs(5));

        assert_eq!(pool.acquire_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(pool.idle_ttl_for("reviewer"), Some(Duration::from_secs(5)));
        assert_eq!(pool.idle_ttl_for("coder"), Some(Duration::from_secs(60)));

        let lease = LeaseConfig::new().with_max_wait(None);
        assert_eq!(lease.max_wait(), None);
    }

    #[test]
    fn test_from_toml() {
        let config = KernelConfig::from_toml_str(
            r#"
            [lease]
            max_wait_ms = 1500
            default_timeout_ms = 10000

            [pool]
            capacity = 4
            exhaustion_policy = "block"
            idle_ttl_ms = 60000

            [pool.type_ttl_ms]
            researcher = 120000

            [pool.score_weights]
            frequency = 2.0

            [logging]
            level = "lanekeeper=debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.lease.max_wait(), Some(Duration::from_millis(1500)));
        assert_eq!(config.lease.default_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.pool.exhaustion_policy, ExhaustionPolicy::Block);
        assert_eq!(config.pool.idle_ttl_for("researcher"), Some(Duration::from_secs(120)));
        assert_eq!(config.pool.score_weights.frequency, 2.0);
        assert_eq!(config.pool.score_weights.recency_per_sec, 0.05);
        assert_eq!(config.logging.level, "lanekeeper=debug");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = KernelConfig::from_toml_str("[pool]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = KernelConfig::from_toml_str("[pool]\ncapacity = \"many\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\ncapacity = 3").unwrap();
        let config = KernelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.capacity, 3);

        let missing = KernelConfig::from_file("/nonexistent/lanekeeper.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
