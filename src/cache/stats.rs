//! Per-cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic counters for one cache.
///
/// Disabled stats ignore every record call.
#[derive(Debug)]
pub struct CacheStats {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_nanos: AtomicU64,
    evictions: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new(true)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
            load_successes: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            total_load_nanos: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_l1_hit(&self) {
        if self.enabled {
            bump(&self.hits);
            bump(&self.l1_hits);
        }
    }

    pub fn record_l1_miss(&self) {
        if self.enabled {
            bump(&self.l1_misses);
        }
    }

    pub fn record_l2_hit(&self) {
        if self.enabled {
            bump(&self.hits);
            bump(&self.l2_hits);
        }
    }

    pub fn record_l2_miss(&self) {
        if self.enabled {
            bump(&self.l2_misses);
        }
    }

    /// A read no tier could answer.
    pub fn record_miss(&self) {
        if self.enabled {
            bump(&self.misses);
        }
    }

    pub fn record_load(&self, elapsed: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        if success {
            bump(&self.load_successes);
        } else {
            bump(&self.load_failures);
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_load_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        if self.enabled {
            bump(&self.evictions);
        }
    }

    pub fn record_puts(&self, count: u64) {
        if self.enabled {
            self.puts.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_removes(&self, count: u64) {
        if self.enabled {
            self.removes.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Copy the counters. `l1_size` is supplied by the owner.
    pub fn snapshot(&self, l1_size: u64) -> CacheStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits: load(&self.hits),
            misses: load(&self.misses),
            l1_hits: load(&self.l1_hits),
            l1_misses: load(&self.l1_misses),
            l2_hits: load(&self.l2_hits),
            l2_misses: load(&self.l2_misses),
            load_successes: load(&self.load_successes),
            load_failures: load(&self.load_failures),
            total_load_time: Duration::from_nanos(load(&self.total_load_nanos)),
            evictions: load(&self.evictions),
            puts: load(&self.puts),
            removes: load(&self.removes),
            l1_size,
        }
    }

    /// Zero every counter. Cached entries are untouched.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.l1_hits,
            &self.l1_misses,
            &self.l2_hits,
            &self.l2_misses,
            &self.load_successes,
            &self.load_failures,
            &self.total_load_nanos,
            &self.evictions,
            &self.puts,
            &self.removes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    pub total_load_time: Duration,
    pub evictions: u64,
    pub puts: u64,
    pub removes: u64,
    pub l1_size: u64,
}

impl CacheStatsSnapshot {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }

    pub fn miss_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            total => self.misses as f64 / total as f64,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_rates() {
        let stats = CacheStats::new(true);
        stats.record_l1_hit();
        stats.record_l1_miss();
        stats.record_l2_hit();
        stats.record_l1_miss();
        stats.record_l2_miss();
        stats.record_miss();
        stats.record_load(Duration::from_millis(4), true);
        stats.record_puts(2);

        let snapshot = stats.snapshot(5);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!((snapshot.l1_hits, snapshot.l1_misses), (1, 2));
        assert_eq!((snapshot.l2_hits, snapshot.l2_misses), (1, 1));
        assert_eq!(snapshot.puts, 2);
        assert_eq!(snapshot.l1_size, 5);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.average_load_time(), Duration::from_millis(4));
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let stats = CacheStats::default();
        stats.record_l1_hit();
        stats.record_eviction();
        stats.reset();
        assert_eq!(stats.snapshot(0), CacheStatsSnapshot::default());
    }

    #[test]
    fn test_disabled_stats_stay_zero() {
        let stats = CacheStats::new(false);
        stats.record_l1_hit();
        stats.record_load(Duration::from_millis(1), false);
        assert_eq!(stats.snapshot(0).requests(), 0);
        assert_eq!(stats.snapshot(0).load_failures, 0);
    }
}
