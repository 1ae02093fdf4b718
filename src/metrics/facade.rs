//! Collector that also emits through the `metrics` facade.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use super::{CacheMetrics, DefaultMetricsCollector, MetricsCollector, Tier};

pub const METRIC_HITS: &str = "tiercache_hits_total";
pub const METRIC_MISSES: &str = "tiercache_misses_total";
pub const METRIC_PUTS: &str = "tiercache_puts_total";
pub const METRIC_REMOVES: &str = "tiercache_removes_total";
pub const METRIC_EVICTIONS: &str = "tiercache_evictions_total";
pub const METRIC_LOAD_SECONDS: &str = "tiercache_load_seconds";
pub const METRIC_OPERATION_SECONDS: &str = "tiercache_operation_seconds";
pub const METRIC_ENTRIES: &str = "tiercache_entries";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register descriptions for every metric this crate emits.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HITS, Unit::Count, "Cache reads answered, by tier.");
        describe_counter!(METRIC_MISSES, Unit::Count, "Cache reads no tier could answer.");
        describe_counter!(METRIC_PUTS, Unit::Count, "Cache writes.");
        describe_counter!(METRIC_REMOVES, Unit::Count, "Cache removals.");
        describe_counter!(
            METRIC_EVICTIONS,
            Unit::Count,
            "Entries evicted by a tier due to capacity."
        );
        describe_histogram!(
            METRIC_LOAD_SECONDS,
            Unit::Seconds,
            "Loader latency in seconds, by outcome."
        );
        describe_histogram!(
            METRIC_OPERATION_SECONDS,
            Unit::Seconds,
            "Coordinator operation latency in seconds."
        );
        describe_gauge!(METRIC_ENTRIES, Unit::Count, "Entries currently held by a tier.");
    });
}

/// Records into an in-memory [`DefaultMetricsCollector`] for queries and
/// emits every event through the globally installed `metrics` recorder.
#[derive(Debug, Default)]
pub struct FacadeMetricsCollector {
    inner: DefaultMetricsCollector,
}

impl FacadeMetricsCollector {
    pub fn new() -> Self {
        describe_metrics();
        Self::default()
    }
}

impl MetricsCollector for FacadeMetricsCollector {
    fn record_hit(&self, cache: &str, tier: Tier) {
        counter!(METRIC_HITS, "cache" => cache.to_string(), "tier" => tier.as_str()).increment(1);
        self.inner.record_hit(cache, tier);
    }

    fn record_miss(&self, cache: &str, tier: Tier) {
        counter!(METRIC_MISSES, "cache" => cache.to_string(), "tier" => tier.as_str())
            .increment(1);
        self.inner.record_miss(cache, tier);
    }

    fn record_put(&self, cache: &str) {
        counter!(METRIC_PUTS, "cache" => cache.to_string()).increment(1);
        self.inner.record_put(cache);
    }

    fn record_remove(&self, cache: &str) {
        counter!(METRIC_REMOVES, "cache" => cache.to_string()).increment(1);
        self.inner.record_remove(cache);
    }

    fn record_eviction(&self, cache: &str, tier: Tier) {
        counter!(METRIC_EVICTIONS, "cache" => cache.to_string(), "tier" => tier.as_str())
            .increment(1);
        self.inner.record_eviction(cache, tier);
    }

    fn record_load(&self, cache: &str, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        histogram!(METRIC_LOAD_SECONDS, "cache" => cache.to_string(), "outcome" => outcome)
            .record(elapsed.as_secs_f64());
        self.inner.record_load(cache, elapsed, success);
    }

    fn record_latency(&self, cache: &str, operation: &'static str, elapsed: Duration) {
        histogram!(
            METRIC_OPERATION_SECONDS,
            "cache" => cache.to_string(),
            "operation" => operation
        )
        .record(elapsed.as_secs_f64());
        self.inner.record_latency(cache, operation, elapsed);
    }

    fn update_size(&self, cache: &str, tier: Tier, size: u64) {
        gauge!(METRIC_ENTRIES, "cache" => cache.to_string(), "tier" => tier.as_str())
            .set(size as f64);
        self.inner.update_size(cache, tier, size);
    }

    fn cache_metrics(&self, cache: &str) -> Option<CacheMetrics> {
        self.inner.cache_metrics(cache)
    }

    fn all_metrics(&self) -> HashMap<String, CacheMetrics> {
        self.inner.all_metrics()
    }

    fn reset(&self, cache: &str) {
        self.inner.reset(cache);
    }
}
