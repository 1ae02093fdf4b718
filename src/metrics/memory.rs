use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;

use super::{CacheMetrics, MetricsCollector, Tier};

/// In-memory collector.
///
/// Each cache's metrics are updated under its map shard lock, so a
/// snapshot never shows a half-applied update.
#[derive(Debug, Default)]
pub struct DefaultMetricsCollector {
    caches: DashMap<String, CacheMetrics>,
}

impl DefaultMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, cache: &str, apply: impl FnOnce(&mut CacheMetrics)) {
        if let Some(mut metrics) = self.caches.get_mut(cache) {
            apply(metrics.value_mut());
            return;
        }
        let mut metrics = self
            .caches
            .entry(cache.to_string())
            .or_insert_with(|| CacheMetrics::new(cache));
        apply(metrics.value_mut());
    }
}

impl MetricsCollector for DefaultMetricsCollector {
    fn record_hit(&self, cache: &str, tier: Tier) {
        self.update(cache, |m| m.hit(tier));
    }

    fn record_miss(&self, cache: &str, tier: Tier) {
        self.update(cache, |m| m.miss(tier));
    }

    fn record_put(&self, cache: &str) {
        self.update(cache, |m| m.puts += 1);
    }

    fn record_remove(&self, cache: &str) {
        self.update(cache, |m| m.removes += 1);
    }

    fn record_eviction(&self, cache: &str, tier: Tier) {
        self.update(cache, |m| m.eviction(tier));
    }

    fn record_load(&self, cache: &str, elapsed: Duration, success: bool) {
        self.update(cache, |m| m.load(elapsed, success));
    }

    fn record_latency(&self, cache: &str, operation: &'static str, elapsed: Duration) {
        self.update(cache, |m| m.latency(operation, elapsed));
    }

    fn update_size(&self, cache: &str, tier: Tier, size: u64) {
        self.update(cache, |m| m.size(tier, size));
    }

    fn cache_metrics(&self, cache: &str) -> Option<CacheMetrics> {
        self.caches.get(cache).map(|m| m.value().clone())
    }

    fn all_metrics(&self) -> HashMap<String, CacheMetrics> {
        self.caches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn reset(&self, cache: &str) {
        self.caches.remove(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_cache_has_no_data() {
        let collector = DefaultMetricsCollector::new();
        assert!(collector.cache_metrics("orders").is_none());
        assert!(collector.all_metrics().is_empty());
    }

    #[test]
    fn test_records_per_cache_and_tier() {
        let collector = DefaultMetricsCollector::new();
        collector.record_hit("orders", Tier::L1);
        collector.record_hit("orders", Tier::L2);
        collector.record_miss("orders", Tier::L2);
        collector.record_put("orders");
        collector.record_remove("orders");
        collector.record_eviction("orders", Tier::L1);
        collector.record_load("orders", Duration::from_millis(5), true);
        collector.record_latency("orders", "get", Duration::from_millis(2));
        collector.record_latency("orders", "get", Duration::from_millis(4));
        collector.update_size("orders", Tier::L1, 7);
        collector.record_put("users");

        let orders = collector.cache_metrics("orders").unwrap();
        assert_eq!(orders.cache_name, "orders");
        assert_eq!((orders.l1_hits, orders.l2_hits, orders.l2_misses), (1, 1, 1));
        assert_eq!((orders.puts, orders.removes, orders.l1_evictions), (1, 1, 1));
        assert_eq!(orders.load_successes, 1);
        assert_eq!(orders.l1_size, 7);
        assert_eq!(orders.operations["get"].count, 2);
        assert_eq!(orders.operations["get"].average(), Duration::from_millis(3));

        assert_eq!(collector.all_metrics().len(), 2);
    }

    #[test]
    fn test_reset_forgets_cache() {
        let collector = DefaultMetricsCollector::new();
        collector.record_put("orders");
        collector.record_put("users");
        collector.reset("orders");

        assert!(collector.cache_metrics("orders").is_none());
        assert!(collector.cache_metrics("users").is_some());
    }
}
