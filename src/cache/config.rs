//! Cache configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::duration_serde;

// Default values for cache configuration
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_L1_MAX_SIZE: u64 = 10_000;
const DEFAULT_L1_EXPIRE_AFTER_WRITE: Duration = Duration::from_secs(600);
const DEFAULT_L1_INITIAL_CAPACITY: usize = 256;
const DEFAULT_KEY_PREFIX: &str = "cache:";
const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_NULL_VALUE_TTL: Duration = Duration::from_secs(60);

/// Configuration for one logical cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Local (in-process) tier settings.
    pub l1: L1Config,

    /// Remote (shared) tier settings.
    pub l2: L2Config,

    /// TTL used when a write does not specify one.
    /// Local entries never outlive it.
    #[serde(with = "duration_serde")]
    pub default_ttl: Duration,

    /// Publish invalidations to peers after mutations.
    pub sync_enabled: bool,

    /// Keep per-cache counters for `stats()`.
    pub statistics_enabled: bool,

    /// Cache absent loader results.
    pub null_values: NullValueConfig,

    /// When the remote tier is written relative to the caller.
    pub write_mode: WriteMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            default_ttl: DEFAULT_TTL,
            sync_enabled: true,
            statistics_enabled: true,
            null_values: NullValueConfig::default(),
            write_mode: WriteMode::WriteThrough,
        }
    }
}

impl CacheConfig {
    /// Set the default TTL (builder pattern).
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Replace the local tier settings.
    #[must_use]
    pub fn l1(mut self, l1: L1Config) -> Self {
        self.l1 = l1;
        self
    }

    /// Replace the remote tier settings.
    #[must_use]
    pub fn l2(mut self, l2: L2Config) -> Self {
        self.l2 = l2;
        self
    }

    /// Enable null-value caching with the given TTL.
    #[must_use]
    pub fn cache_null_values(mut self, ttl: Duration) -> Self {
        self.null_values = NullValueConfig { enabled: true, ttl };
        self
    }

    /// Enable or disable cross-node invalidation.
    #[must_use]
    pub fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    /// Enable or disable statistics collection.
    #[must_use]
    pub fn statistics_enabled(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Set the write mode.
    #[must_use]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// TTL a local entry gets for a write with `requested` TTL.
    ///
    /// Never exceeds the cache default TTL nor the local
    /// expire-after-write window.
    pub fn local_ttl(&self, requested: Duration) -> Duration {
        requested
            .min(self.default_ttl)
            .min(self.l1.expire_after_write)
    }

    /// Create config for data that only lives in-process.
    /// No remote tier, no invalidation traffic.
    pub fn local_only() -> Self {
        Self {
            l2: L2Config {
                enabled: false,
                ..Default::default()
            },
            sync_enabled: false,
            ..Default::default()
        }
    }

    /// Create config for frequently read, frequently changing data.
    /// Short local window so peers converge quickly even if an
    /// invalidation is lost.
    pub fn hot_data() -> Self {
        Self {
            l1: L1Config {
                max_size: 50_000,
                expire_after_write: Duration::from_secs(60),
                expire_after_access: Some(Duration::from_secs(30)),
                ..Default::default()
            },
            default_ttl: Duration::from_secs(600),
            ..Default::default()
        }
    }
}

/// Local tier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct L1Config {
    pub enabled: bool,

    /// Maximum number of entries before least-recently-used eviction.
    pub max_size: u64,

    /// Upper bound on any local entry's lifetime.
    #[serde(with = "duration_serde")]
    pub expire_after_write: Duration,

    /// Entries are evicted if not accessed within this duration.
    #[serde(with = "duration_serde::option")]
    pub expire_after_access: Option<Duration>,

    /// Local hits older than this re-read the remote tier.
    #[serde(with = "duration_serde::option")]
    pub refresh_after_write: Option<Duration>,

    pub initial_capacity: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_L1_MAX_SIZE,
            expire_after_write: DEFAULT_L1_EXPIRE_AFTER_WRITE,
            expire_after_access: None,
            refresh_after_write: None,
            initial_capacity: DEFAULT_L1_INITIAL_CAPACITY,
        }
    }
}

impl L1Config {
    /// Create a local tier config with the given max size.
    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Set the expire-after-write window (builder pattern).
    #[must_use]
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = duration;
        self
    }

    /// Set the idle expiry window.
    #[must_use]
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Set the refresh window.
    #[must_use]
    pub fn refresh_after_write(mut self, duration: Duration) -> Self {
        self.refresh_after_write = Some(duration);
        self
    }
}

/// Remote tier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct L2Config {
    pub enabled: bool,

    /// Prefix prepended to every remote key.
    pub key_prefix: String,

    /// Remote TTL when a write does not specify one.
    #[serde(with = "duration_serde")]
    pub default_ttl: Duration,

    pub compression: CompressionConfig,

    pub batch: BatchConfig,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: DEFAULT_TTL,
            compression: CompressionConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Payload compression for the remote tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,

    #[serde(rename = "type")]
    pub kind: CompressionType,

    /// Serialized values smaller than this many bytes are stored as-is.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            kind: CompressionType::Gzip,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    pub fn gzip(threshold: usize) -> Self {
        Self {
            enabled: true,
            kind: CompressionType::Gzip,
            threshold,
        }
    }

    pub fn zlib(threshold: usize) -> Self {
        Self {
            enabled: true,
            kind: CompressionType::Zlib,
            threshold,
        }
    }
}

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    Zlib,
}

/// Batch operation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Keys per remote round trip; larger batches are chunked.
    pub max_batch_size: usize,

    /// Upper bound on one batch round trip.
    #[serde(with = "duration_serde")]
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// Null-value caching settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NullValueConfig {
    pub enabled: bool,

    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl Default for NullValueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: DEFAULT_NULL_VALUE_TTL,
        }
    }
}

/// Ordering of remote writes relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// The remote tier is written before the call returns; a failed
    /// remote write fails the whole operation.
    #[default]
    WriteThrough,

    /// The call returns after the local write; the remote tier is
    /// written on a background task and failures are only logged.
    WriteBehind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = CacheConfig::default();
        assert!(config.l1.enabled);
        assert!(config.l2.enabled);
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.l1.max_size, 10_000);
        assert_eq!(config.l1.expire_after_write, Duration::from_secs(600));
        assert_eq!(config.l1.initial_capacity, 256);
        assert_eq!(config.l2.key_prefix, "cache:");
        assert!(!config.l2.compression.enabled);
        assert_eq!(config.l2.batch.max_batch_size, 100);
        assert_eq!(config.l2.batch.batch_timeout, Duration::from_millis(50));
        assert!(!config.null_values.enabled);
        assert_eq!(config.null_values.ttl, Duration::from_secs(60));
        assert_eq!(config.write_mode, WriteMode::WriteThrough);
    }

    #[test]
    fn test_local_ttl_is_capped() {
        let config = CacheConfig::default()
            .default_ttl(Duration::from_secs(10))
            .l1(L1Config::default().expire_after_write(Duration::from_secs(60)));

        assert_eq!(config.local_ttl(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(config.local_ttl(Duration::from_secs(30)), Duration::from_secs(10));

        let config = CacheConfig::default()
            .l1(L1Config::default().expire_after_write(Duration::from_secs(5)));
        assert_eq!(config.local_ttl(Duration::from_secs(30)), Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: CacheConfig = serde_json::from_str(
            r#"{
                "default_ttl": "10s",
                "l1": { "max_size": 2, "expire_after_access": "5m" },
                "l2": {
                    "key_prefix": "app:",
                    "compression": { "enabled": true, "type": "zlib", "threshold": 64 },
                    "batch": { "max_batch_size": 20, "batch_timeout": "250ms" }
                },
                "null_values": { "enabled": true, "ttl": "30s" },
                "write_mode": "write-behind"
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_ttl, Duration::from_secs(10));
        assert_eq!(config.l1.max_size, 2);
        assert_eq!(config.l1.expire_after_access, Some(Duration::from_secs(300)));
        assert_eq!(config.l1.refresh_after_write, None);
        assert_eq!(config.l2.key_prefix, "app:");
        assert_eq!(config.l2.compression.kind, CompressionType::Zlib);
        assert_eq!(config.l2.compression.threshold, 64);
        assert_eq!(config.l2.batch.batch_timeout, Duration::from_millis(250));
        assert!(config.null_values.enabled);
        assert_eq!(config.write_mode, WriteMode::WriteBehind);
    }

    #[test]
    fn test_local_only_preset() {
        let config = CacheConfig::local_only();
        assert!(config.l1.enabled);
        assert!(!config.l2.enabled);
        assert!(!config.sync_enabled);
    }
}
