//! Configuration for a tiercache node.
//!
//! Loads settings from environment variables (and `.env`). Every variable
//! is optional; unset ones keep the library defaults. Set ones must parse,
//! otherwise loading fails with the offending variable named.
//!
//! | Variable | Example |
//! |---|---|
//! | `TIERCACHE_NODE_ID` | `node-a` |
//! | `TIERCACHE_REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `TIERCACHE_CHANNEL` | `cache:invalidate` |
//! | `TIERCACHE_DEFAULT_TTL` | `30m` |
//! | `TIERCACHE_SYNC_ENABLED`, `TIERCACHE_STATISTICS_ENABLED` | `true` |
//! | `TIERCACHE_WRITE_MODE` | `write-through` / `write-behind` |
//! | `TIERCACHE_L1_ENABLED`, `TIERCACHE_L1_MAX_SIZE` | `true`, `10000` |
//! | `TIERCACHE_L1_EXPIRE_AFTER_WRITE`, `..._ACCESS`, `TIERCACHE_L1_REFRESH_AFTER_WRITE` | `5m` |
//! | `TIERCACHE_L2_ENABLED`, `TIERCACHE_L2_KEY_PREFIX`, `TIERCACHE_L2_DEFAULT_TTL` | `cache:` |
//! | `TIERCACHE_COMPRESSION`, `TIERCACHE_COMPRESSION_THRESHOLD` | `gzip`, `1024` |
//! | `TIERCACHE_BATCH_SIZE`, `TIERCACHE_BATCH_TIMEOUT` | `100`, `50ms` |
//! | `TIERCACHE_FAILURE_THRESHOLD`, `TIERCACHE_OPEN_STATE_DURATION`, `TIERCACHE_HALF_OPEN_MAX_CALLS` | `5`, `30s`, `3` |
//! | `TIERCACHE_RETRY_MAX_ATTEMPTS`, `..._INITIAL_DELAY`, `..._MAX_DELAY`, `..._MULTIPLIER` | `3`, `100ms`, `1s`, `2.0` |
//! | `TIERCACHE_NULL_VALUE_TTL` | `60s` (enables null-value caching) |

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::cache::{CacheConfig, CompressionConfig, NullValueConfig, WriteMode};
use crate::resilience::{ResilienceConfig, RetryConfig};
use crate::sync::DEFAULT_CHANNEL;
use crate::utils::{parse_bool, parse_duration};

const PREFIX: &str = "TIERCACHE_";

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Identity stamped on published invalidations; generated when unset.
    pub node_id: Option<String>,

    /// Redis URL. Without it the node runs on in-process tiers.
    pub redis_url: Option<String>,

    /// Pub/sub channel carrying invalidations.
    pub channel: String,

    /// Defaults for every cache the node creates.
    pub cache: CacheConfig,

    pub resilience: ResilienceConfig,

    pub retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_id: None,
            redis_url: None,
            channel: DEFAULT_CHANNEL.to_string(),
            cache: CacheConfig::default(),
            resilience: ResilienceConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from `.env` and the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load settings through `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut settings = Settings {
            node_id: vars.string("NODE_ID"),
            redis_url: vars.string("REDIS_URL"),
            ..Default::default()
        };
        if let Some(channel) = vars.string("CHANNEL") {
            settings.channel = channel;
        }

        let cache = &mut settings.cache;
        if let Some(ttl) = vars.duration("DEFAULT_TTL")? {
            cache.default_ttl = ttl;
        }
        if let Some(enabled) = vars.flag("SYNC_ENABLED")? {
            cache.sync_enabled = enabled;
        }
        if let Some(enabled) = vars.flag("STATISTICS_ENABLED")? {
            cache.statistics_enabled = enabled;
        }
        if let Some(mode) = vars.string("WRITE_MODE") {
            cache.write_mode = parse_write_mode(&mode)
                .with_context(|| format!("{PREFIX}WRITE_MODE: unknown mode '{mode}'"))?;
        }
        if let Some(ttl) = vars.duration("NULL_VALUE_TTL")? {
            cache.null_values = NullValueConfig { enabled: true, ttl };
        }

        let l1 = &mut cache.l1;
        if let Some(enabled) = vars.flag("L1_ENABLED")? {
            l1.enabled = enabled;
        }
        if let Some(max_size) = vars.parse("L1_MAX_SIZE")? {
            l1.max_size = max_size;
        }
        if let Some(ttl) = vars.duration("L1_EXPIRE_AFTER_WRITE")? {
            l1.expire_after_write = ttl;
        }
        if let Some(tti) = vars.duration("L1_EXPIRE_AFTER_ACCESS")? {
            l1.expire_after_access = Some(tti);
        }
        if let Some(refresh) = vars.duration("L1_REFRESH_AFTER_WRITE")? {
            l1.refresh_after_write = Some(refresh);
        }

        let l2 = &mut cache.l2;
        if let Some(enabled) = vars.flag("L2_ENABLED")? {
            l2.enabled = enabled;
        }
        if let Some(prefix) = vars.string("L2_KEY_PREFIX") {
            l2.key_prefix = prefix;
        }
        if let Some(ttl) = vars.duration("L2_DEFAULT_TTL")? {
            l2.default_ttl = ttl;
        }
        let threshold = vars
            .parse("COMPRESSION_THRESHOLD")?
            .unwrap_or(l2.compression.threshold);
        if let Some(kind) = vars.string("COMPRESSION") {
            l2.compression = match kind.to_ascii_lowercase().as_str() {
                "gzip" => CompressionConfig::gzip(threshold),
                "zlib" => CompressionConfig::zlib(threshold),
                "off" | "none" => CompressionConfig::disabled(),
                other => bail!("{PREFIX}COMPRESSION: unknown algorithm '{other}'"),
            };
        }
        if let Some(size) = vars.parse("BATCH_SIZE")? {
            l2.batch.max_batch_size = size;
        }
        if let Some(timeout) = vars.duration("BATCH_TIMEOUT")? {
            l2.batch.batch_timeout = timeout;
        }

        let resilience = &mut settings.resilience;
        if let Some(threshold) = vars.parse::<u32>("FAILURE_THRESHOLD")? {
            resilience.failure_threshold = threshold.max(1);
        }
        if let Some(duration) = vars.duration("OPEN_STATE_DURATION")? {
            resilience.open_state_duration = duration;
        }
        if let Some(calls) = vars.parse::<u32>("HALF_OPEN_MAX_CALLS")? {
            resilience.half_open_max_calls = calls.max(1);
        }

        let retry = &mut settings.retry;
        if let Some(attempts) = vars.parse::<u32>("RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = attempts.max(1);
        }
        if let Some(delay) = vars.duration("RETRY_INITIAL_DELAY")? {
            retry.initial_delay = delay;
        }
        if let Some(delay) = vars.duration("RETRY_MAX_DELAY")? {
            retry.max_delay = delay;
        }
        if let Some(multiplier) = vars.parse::<f64>("RETRY_MULTIPLIER")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                bail!("{PREFIX}RETRY_MULTIPLIER: must be at least 1.0, got {multiplier}");
            }
            retry.multiplier = multiplier;
        }

        Ok(settings)
    }
}

fn parse_write_mode(input: &str) -> Option<WriteMode> {
    match input.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "write-through" | "through" => Some(WriteMode::WriteThrough),
        "write-behind" | "behind" => Some(WriteMode::WriteBehind),
        _ => None,
    }
}

/// Typed access to `TIERCACHE_*` variables.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow::anyhow!("{PREFIX}{name}: invalid value '{raw}': {e}"))
            })
            .transpose()
    }

    fn duration(&self, name: &str) -> anyhow::Result<Option<Duration>> {
        self.string(name)
            .map(|raw| {
                parse_duration(&raw)
                    .with_context(|| format!("{PREFIX}{name}: invalid duration '{raw}'"))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> anyhow::Result<Option<bool>> {
        self.string(name)
            .map(|raw| {
                parse_bool(&raw).with_context(|| format!("{PREFIX}{name}: invalid flag '{raw}'"))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::cache::CompressionType;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{PREFIX}{k}"), v.to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let settings = load(&[]).unwrap();
        assert!(settings.node_id.is_none());
        assert!(settings.redis_url.is_none());
        assert_eq!(settings.channel, DEFAULT_CHANNEL);
        assert_eq!(settings.cache.default_ttl, CacheConfig::default().default_ttl);
        assert_eq!(settings.resilience.failure_threshold, 5);
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn test_reads_every_section() {
        let settings = load(&[
            ("NODE_ID", "node-a"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("DEFAULT_TTL", "10m"),
            ("WRITE_MODE", "write-behind"),
            ("NULL_VALUE_TTL", "30s"),
            ("L1_MAX_SIZE", "2"),
            ("L1_REFRESH_AFTER_WRITE", "1m"),
            ("L2_KEY_PREFIX", "app:"),
            ("COMPRESSION", "zlib"),
            ("COMPRESSION_THRESHOLD", "512"),
            ("BATCH_SIZE", "25"),
            ("FAILURE_THRESHOLD", "3"),
            ("OPEN_STATE_DURATION", "5s"),
            ("RETRY_MAX_ATTEMPTS", "1"),
        ])
        .unwrap();

        assert_eq!(settings.node_id.as_deref(), Some("node-a"));
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(600));
        assert_eq!(settings.cache.write_mode, WriteMode::WriteBehind);
        assert!(settings.cache.null_values.enabled);
        assert_eq!(settings.cache.null_values.ttl, Duration::from_secs(30));
        assert_eq!(settings.cache.l1.max_size, 2);
        assert_eq!(settings.cache.l1.refresh_after_write, Some(Duration::from_secs(60)));
        assert_eq!(settings.cache.l2.key_prefix, "app:");
        assert_eq!(settings.cache.l2.compression.kind, CompressionType::Zlib);
        assert_eq!(settings.cache.l2.compression.threshold, 512);
        assert_eq!(settings.cache.l2.batch.max_batch_size, 25);
        assert_eq!(settings.resilience.failure_threshold, 3);
        assert_eq!(settings.resilience.open_state_duration, Duration::from_secs(5));
        assert_eq!(settings.retry.max_attempts, 1);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = load(&[("DEFAULT_TTL", "soon")]).unwrap_err();
        assert!(err.to_string().contains("TIERCACHE_DEFAULT_TTL"));

        let err = load(&[("L1_MAX_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("TIERCACHE_L1_MAX_SIZE"));

        assert!(load(&[("WRITE_MODE", "sideways")]).is_err());
        assert!(load(&[("COMPRESSION", "brotli")]).is_err());
        assert!(load(&[("SYNC_ENABLED", "maybe")]).is_err());
        assert!(load(&[("RETRY_MULTIPLIER", "0.5")]).is_err());
    }

    #[test]
    fn test_blank_values_are_unset() {
        let settings = load(&[("NODE_ID", "  "), ("DEFAULT_TTL", "")]).unwrap();
        assert!(settings.node_id.is_none());
        assert_eq!(settings.cache.default_ttl, CacheConfig::default().default_ttl);
    }
}
