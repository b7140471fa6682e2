//! Cache configuration types.

use crate::codec::SerializationFormat;
use crate::error::{CacheError, CacheResult};
use crate::keys::DEFAULT_ROOT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[cfg(feature = "redis")]
use tagcache_redis::RedisConfig;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default grace period added to the sweep cutoff.
pub const DEFAULT_EXPIRY_GRACE_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    /// Connection settings for the Redis store.
    #[cfg(feature = "redis")]
    pub redis: RedisConfig,

    /// Namespace prefix of the index keys.
    pub root_namespace: String,

    /// Envelope serialization format.
    pub serializer: SerializationFormat,

    /// Run the periodic expiry sweep.
    pub manually_process_expired_keys: bool,

    /// Interval between expiry sweeps.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Added to "now" when a sweep picks scheduled keys.
    #[serde(with = "duration_secs")]
    pub expiry_grace_period: Duration,

    /// Listen for keys the store expires natively.
    pub subscribe_to_expiry_events: bool,

    /// Cap on concurrent per-key Store round trips in fan-out operations.
    pub max_parallelism: usize,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            #[cfg(feature = "redis")]
            redis: RedisConfig::default(),
            root_namespace: DEFAULT_ROOT_NAMESPACE.to_string(),
            serializer: SerializationFormat::default(),
            manually_process_expired_keys: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            expiry_grace_period: DEFAULT_EXPIRY_GRACE_PERIOD,
            subscribe_to_expiry_events: true,
            max_parallelism: default_parallelism(),
        }
    }
}

impl CacheConfiguration {
    /// Create a configuration with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagcache::{CacheConfiguration, SerializationFormat};
    /// use std::time::Duration;
    ///
    /// let config = CacheConfiguration::new()
    ///     .with_root_namespace("orders")
    ///     .with_serializer(SerializationFormat::Binary)
    ///     .with_manual_expiry(true)
    ///     .with_sweep_interval(Duration::from_secs(3600));
    ///
    /// assert_eq!(config.root_namespace, "orders");
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from the environment on top of the defaults.
    ///
    /// Reads `TAGCACHE_ROOT_NAMESPACE`, `TAGCACHE_SERIALIZER`,
    /// `TAGCACHE_MANUAL_EXPIRY`, `TAGCACHE_SWEEP_INTERVAL_SECS` and
    /// `TAGCACHE_GRACE_PERIOD_SECS`, plus the `REDIS_*` variables.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading the `TAGCACHE_*` variables
    /// through `lookup`. `REDIS_*` still come from the process environment.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        #[cfg(feature = "redis")]
        {
            config.redis = RedisConfig::from_env().build();
        }

        if let Some(root) = lookup("TAGCACHE_ROOT_NAMESPACE") {
            config.root_namespace = root;
        }
        if let Some(serializer) = lookup("TAGCACHE_SERIALIZER") {
            config.serializer = serializer.parse()?;
        }
        if let Some(manual) = lookup("TAGCACHE_MANUAL_EXPIRY") {
            config.manually_process_expired_keys = parse_flag("TAGCACHE_MANUAL_EXPIRY", &manual)?;
        }
        if let Some(secs) = lookup("TAGCACHE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = parse_secs("TAGCACHE_SWEEP_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = lookup("TAGCACHE_GRACE_PERIOD_SECS") {
            config.expiry_grace_period = parse_secs("TAGCACHE_GRACE_PERIOD_SECS", &secs)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the Redis connection settings.
    #[cfg(feature = "redis")]
    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.redis = redis;
        self
    }

    /// Set the root namespace.
    pub fn with_root_namespace(mut self, root: impl Into<String>) -> Self {
        self.root_namespace = root.into();
        self
    }

    /// Set the serialization format.
    pub fn with_serializer(mut self, serializer: SerializationFormat) -> Self {
        self.serializer = serializer;
        self
    }

    /// Enable or disable the periodic expiry sweep.
    pub fn with_manual_expiry(mut self, enabled: bool) -> Self {
        self.manually_process_expired_keys = enabled;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the sweep grace period.
    pub fn with_expiry_grace_period(mut self, grace: Duration) -> Self {
        self.expiry_grace_period = grace;
        self
    }

    /// Enable or disable the expiry event subscription.
    pub fn with_expiry_events(mut self, enabled: bool) -> Self {
        self.subscribe_to_expiry_events = enabled;
        self
    }

    /// Set the fan-out cap.
    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    /// Check the settings.
    pub fn validate(&self) -> CacheResult<()> {
        if self.root_namespace.is_empty() {
            return Err(CacheError::Configuration(
                "root namespace must not be empty".to_string(),
            ));
        }
        if self.max_parallelism == 0 {
            return Err(CacheError::Configuration(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.manually_process_expired_keys && self.sweep_interval.is_zero() {
            return Err(CacheError::Configuration(
                "sweep interval must be positive".to_string(),
            ));
        }
        #[cfg(feature = "redis")]
        self.redis.validate()?;
        Ok(())
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_flag(name: &str, value: &str) -> CacheResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CacheError::Configuration(format!(
            "{}: expected a boolean, got '{}'",
            name, other
        ))),
    }
}

fn parse_secs(name: &str, value: &str) -> CacheResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| CacheError::Configuration(format!("{}: {}", name, e)))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfiguration::default();
        assert_eq!(config.root_namespace, "_redisCache");
        assert_eq!(config.serializer, SerializationFormat::Json);
        assert!(!config.manually_process_expired_keys);
        assert!(config.subscribe_to_expiry_events);
        assert_eq!(config.sweep_interval, Duration::from_secs(21_600));
        assert_eq!(config.expiry_grace_period, Duration::from_secs(900));
        assert!(config.max_parallelism >= 1);
    }

    #[test]
    fn test_from_lookup() {
        let config = CacheConfiguration::from_lookup(lookup(&[
            ("TAGCACHE_ROOT_NAMESPACE", "orders"),
            ("TAGCACHE_SERIALIZER", "xml"),
            ("TAGCACHE_MANUAL_EXPIRY", "true"),
            ("TAGCACHE_SWEEP_INTERVAL_SECS", "60"),
            ("TAGCACHE_GRACE_PERIOD_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.root_namespace, "orders");
        assert_eq!(config.serializer, SerializationFormat::Xml);
        assert!(config.manually_process_expired_keys);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.expiry_grace_period, Duration::ZERO);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = CacheConfiguration::from_lookup(lookup(&[("TAGCACHE_SERIALIZER", "yaml")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));

        let err = CacheConfiguration::from_lookup(lookup(&[("TAGCACHE_MANUAL_EXPIRY", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_validate() {
        assert!(CacheConfiguration::new().with_root_namespace("").validate().is_err());
        assert!(CacheConfiguration::new().with_max_parallelism(0).validate().is_err());
        assert!(
            CacheConfiguration::new()
                .with_manual_expiry(true)
                .with_sweep_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_serde_uses_seconds_and_defaults() {
        let config: CacheConfiguration =
            serde_json::from_str(r#"{"root_namespace":"x","sweep_interval":120}"#).unwrap();
        assert_eq!(config.root_namespace, "x");
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert_eq!(config.expiry_grace_period, DEFAULT_EXPIRY_GRACE_PERIOD);
    }
}
