//! Configuration for the mitigation pipeline.
//!
//! Everything is constructed explicitly and passed down; there are no
//! process-wide singletons. `MitigationConfig::from_env` reads the
//! environment surface, `Default` gives the documented defaults.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{MitigationError, Result};
use crate::types::ServiceKind;

/// Default upstream endpoints. Override per deployment via the environment.
const DEFAULT_VISION_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";
const DEFAULT_MAPS_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/nearbysearch/json";

/// Per-upstream-service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URL of the upstream API.
    pub endpoint: String,

    /// Credential pool rotated through by the key rotator.
    pub credentials: Vec<SecretString>,

    /// Sliding-window quota enforced per key.
    pub max_requests_per_minute: usize,

    /// Batch window tuning for this service.
    pub batch: BatchConfig,
}

/// Batch window configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Whether requests for this service go through a batch window at all.
    pub enabled: bool,

    /// Window flushes once it holds this many entries.
    pub max_batch_size: usize,

    /// Window flushes this long after its first entry was admitted.
    pub batch_timeout: Duration,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,

    /// How long an open circuit waits before allowing a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Cache tier lifetimes.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub fresh_ttl: Duration,
    pub medium_ttl: Duration,
    pub long_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl: Duration::from_secs(300),
            medium_ttl: Duration::from_secs(900),
            long_ttl: Duration::from_secs(3600),
        }
    }
}

/// Degraded-trust mode entered after repeated total failures.
#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    /// Consecutive full-chain failures (cache miss + upstream path failure)
    /// that activate emergency mode.
    pub activation_threshold: u32,

    /// How long emergency mode stays active before the network path is
    /// allowed again.
    pub cooldown: Duration,

    /// Multiplier applied to cache tier lifetimes while emergency mode is
    /// active.
    pub cache_extension_factor: u32,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 5,
            cooldown: Duration::from_secs(60),
            cache_extension_factor: 3,
        }
    }
}

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct MitigationConfig {
    pub vision: ServiceConfig,
    pub maps: ServiceConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub emergency: EmergencyConfig,

    /// Sliding window over which per-key request quotas are counted.
    pub rate_window: Duration,

    /// How long a rate-limited key stays blacklisted.
    pub blacklist_duration: Duration,

    /// Timeout for one upstream HTTP attempt.
    pub request_timeout: Duration,

    /// Hard cap on how long a caller waits for a batched result before it is
    /// resolved via fallback.
    pub result_timeout: Duration,

    /// Seed the fresh cache tier with fallback results to damp repeated
    /// fallback work for the same fingerprint.
    pub seed_fallback_results: bool,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            vision: ServiceConfig {
                endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
                credentials: Vec::new(),
                max_requests_per_minute: 10,
                batch: BatchConfig {
                    enabled: true,
                    max_batch_size: 5,
                    batch_timeout: Duration::from_secs(2),
                },
            },
            maps: ServiceConfig {
                endpoint: DEFAULT_MAPS_ENDPOINT.to_string(),
                credentials: Vec::new(),
                max_requests_per_minute: 20,
                // The maps API has no multi-part prompt, so its requests are
                // dispatched directly.
                batch: BatchConfig {
                    enabled: false,
                    max_batch_size: 3,
                    batch_timeout: Duration::from_millis(1500),
                },
            },
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            emergency: EmergencyConfig::default(),
            rate_window: Duration::from_secs(60),
            blacklist_duration: Duration::from_secs(300),
            request_timeout: Duration::from_secs(15),
            result_timeout: Duration::from_secs(10),
            seed_fallback_results: true,
        }
    }
}

impl MitigationConfig {
    /// Read configuration from the environment, falling back to defaults for
    /// anything unset.
    ///
    /// Keys are comma-separated lists: `CROWDGATE_VISION_KEYS=key1,key2`.
    /// Durations use humantime syntax: `CROWDGATE_BREAKER_COOLDOWN=5m`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(endpoint) = env_string("CROWDGATE_VISION_ENDPOINT") {
            config.vision.endpoint = endpoint;
        }
        if let Some(endpoint) = env_string("CROWDGATE_MAPS_ENDPOINT") {
            config.maps.endpoint = endpoint;
        }
        config.vision.credentials = env_keys("CROWDGATE_VISION_KEYS");
        config.maps.credentials = env_keys("CROWDGATE_MAPS_KEYS");

        if let Some(rpm) = env_usize("CROWDGATE_VISION_RPM")? {
            config.vision.max_requests_per_minute = rpm;
        }
        if let Some(rpm) = env_usize("CROWDGATE_MAPS_RPM")? {
            config.maps.max_requests_per_minute = rpm;
        }

        if let Some(size) = env_usize("CROWDGATE_BATCH_SIZE")? {
            config.vision.batch.max_batch_size = size;
        }
        if let Some(timeout) = env_duration("CROWDGATE_BATCH_TIMEOUT")? {
            config.vision.batch.batch_timeout = timeout;
        }
        if let Some(enabled) = env_bool("CROWDGATE_BATCH_ENABLED")? {
            config.vision.batch.enabled = enabled;
        }

        if let Some(max) = env_usize("CROWDGATE_BREAKER_MAX_FAILURES")? {
            config.breaker.max_failures = max as u32;
        }
        if let Some(cooldown) = env_duration("CROWDGATE_BREAKER_COOLDOWN")? {
            config.breaker.cooldown = cooldown;
        }

        if let Some(ttl) = env_duration("CROWDGATE_CACHE_FRESH_TTL")? {
            config.cache.fresh_ttl = ttl;
        }
        if let Some(ttl) = env_duration("CROWDGATE_CACHE_MEDIUM_TTL")? {
            config.cache.medium_ttl = ttl;
        }
        if let Some(ttl) = env_duration("CROWDGATE_CACHE_LONG_TTL")? {
            config.cache.long_ttl = ttl;
        }

        if let Some(duration) = env_duration("CROWDGATE_BLACKLIST_DURATION")? {
            config.blacklist_duration = duration;
        }
        if let Some(timeout) = env_duration("CROWDGATE_REQUEST_TIMEOUT")? {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = env_duration("CROWDGATE_RESULT_TIMEOUT")? {
            config.result_timeout = timeout;
        }

        Ok(config)
    }

    pub fn service(&self, kind: ServiceKind) -> &ServiceConfig {
        match kind {
            ServiceKind::Vision => &self.vision,
            ServiceKind::Maps => &self.maps,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_keys(name: &str) -> Vec<SecretString> {
    env_string(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| SecretString::from(k.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| MitigationError::Config(format!("{name}: {e}"))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => Err(MitigationError::Config(format!(
                "{name}: expected boolean, got {other:?}"
            ))),
        },
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| MitigationError::Config(format!("{name}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MitigationConfig::default();
        assert_eq!(config.vision.max_requests_per_minute, 10);
        assert_eq!(config.maps.max_requests_per_minute, 20);
        assert_eq!(config.breaker.max_failures, 3);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(300));
        assert_eq!(config.cache.fresh_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.medium_ttl, Duration::from_secs(900));
        assert_eq!(config.cache.long_ttl, Duration::from_secs(3600));
        assert_eq!(config.vision.batch.max_batch_size, 5);
        assert_eq!(config.vision.batch.batch_timeout, Duration::from_secs(2));
        assert_eq!(config.blacklist_duration, Duration::from_secs(300));
        assert_eq!(config.emergency.activation_threshold, 5);
    }

    #[test]
    fn test_env_keys_parsing() {
        // Uses a name no other test reads to avoid env races.
        std::env::set_var("CROWDGATE_TEST_KEYS", "alpha, beta,,gamma");
        let keys = env_keys("CROWDGATE_TEST_KEYS");
        assert_eq!(keys.len(), 3);
        std::env::remove_var("CROWDGATE_TEST_KEYS");
    }

    #[test]
    fn test_env_duration_rejects_garbage() {
        std::env::set_var("CROWDGATE_TEST_DURATION", "not-a-duration");
        assert!(env_duration("CROWDGATE_TEST_DURATION").is_err());
        std::env::remove_var("CROWDGATE_TEST_DURATION");
    }
}
