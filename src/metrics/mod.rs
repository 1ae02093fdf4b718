//! Cache metrics.
//!
//! Coordinators report every operation to a [`MetricsCollector`]:
//!
//! - exactly one hit or miss per read, tagged with the tier that
//!   answered (a miss is tagged with the last tier consulted)
//! - one put or remove per mutating call
//! - evictions as the local tier reports them
//!
//! Recording never fails and never blocks on I/O.

mod facade;
mod memory;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use facade::{FacadeMetricsCollector, describe_metrics};
pub use memory::DefaultMetricsCollector;

/// Cache tier a metric refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    L1,
    L2,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::L1 => "l1",
            Tier::L2 => "l2",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count and cumulative time of one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub count: u64,
    pub total_time: Duration,
}

impl OperationStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_time / u32::try_from(self.count).unwrap_or(u32::MAX)
        }
    }
}

/// Point-in-time metrics of one cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMetrics {
    pub cache_name: String,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub l1_evictions: u64,
    pub l2_evictions: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    pub total_load_time: Duration,
    pub l1_size: u64,
    pub l2_size: u64,
    pub operations: HashMap<&'static str, OperationStats>,
}

impl CacheMetrics {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits
    }

    /// Reads that found nothing in any tier.
    ///
    /// With a remote tier, L1 misses that L2 answered are counted as L2
    /// hits, so only the tier tagged on the final outcome is counted.
    pub fn misses(&self) -> u64 {
        self.l1_misses + self.l2_misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn average_load_time(&self) -> Duration {
        let loads = self.load_successes + self.load_failures;
        if loads == 0 {
            Duration::ZERO
        } else {
            self.total_load_time / u32::try_from(loads).unwrap_or(u32::MAX)
        }
    }

    fn hit(&mut self, tier: Tier) {
        match tier {
            Tier::L1 => self.l1_hits += 1,
            Tier::L2 => self.l2_hits += 1,
        }
    }

    fn miss(&mut self, tier: Tier) {
        match tier {
            Tier::L1 => self.l1_misses += 1,
            Tier::L2 => self.l2_misses += 1,
        }
    }

    fn eviction(&mut self, tier: Tier) {
        match tier {
            Tier::L1 => self.l1_evictions += 1,
            Tier::L2 => self.l2_evictions += 1,
        }
    }

    fn load(&mut self, elapsed: Duration, success: bool) {
        if success {
            self.load_successes += 1;
        } else {
            self.load_failures += 1;
        }
        self.total_load_time += elapsed;
    }

    fn latency(&mut self, operation: &'static str, elapsed: Duration) {
        let stats = self.operations.entry(operation).or_default();
        stats.count += 1;
        stats.total_time += elapsed;
    }

    fn size(&mut self, tier: Tier, size: u64) {
        match tier {
            Tier::L1 => self.l1_size = size,
            Tier::L2 => self.l2_size = size,
        }
    }
}

/// Sink for cache metrics.
///
/// Implementations must not panic and must not block the caller.
pub trait MetricsCollector: Send + Sync {
    fn record_hit(&self, cache: &str, tier: Tier);

    fn record_miss(&self, cache: &str, tier: Tier);

    fn record_put(&self, cache: &str);

    fn record_remove(&self, cache: &str);

    fn record_eviction(&self, cache: &str, tier: Tier);

    /// Record one loader invocation.
    fn record_load(&self, cache: &str, elapsed: Duration, success: bool);

    /// Record the duration of a coordinator operation (`get`, `put`, ...).
    fn record_latency(&self, _cache: &str, _operation: &'static str, _elapsed: Duration) {}

    fn update_size(&self, cache: &str, tier: Tier, size: u64);

    /// Snapshot of one cache, `None` if nothing was ever recorded for it.
    fn cache_metrics(&self, cache: &str) -> Option<CacheMetrics>;

    fn all_metrics(&self) -> HashMap<String, CacheMetrics>;

    /// Forget everything recorded for `cache`.
    fn reset(&self, cache: &str);
}
