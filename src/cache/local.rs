//! Local (L1) tier backed by Moka.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use super::config::L1Config;

/// A value held by a tier, with the lifetime it was written with.
///
/// `value` is `None` for a cached absent result.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: Option<V>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: Option<V>, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Bounded, TTL-aware in-process map.
///
/// Implementations handle eviction and expiry themselves and must be safe
/// to call concurrently.
pub trait LocalTier<V>: Send + Sync {
    /// Get a live entry.
    fn get(&self, key: &str) -> Option<CacheEntry<V>>;

    fn put(&self, key: &str, entry: CacheEntry<V>);

    /// Insert only if no live entry exists. Returns `true` if inserted.
    fn put_if_absent(&self, key: &str, entry: CacheEntry<V>) -> bool;

    fn invalidate(&self, key: &str);

    fn invalidate_all(&self);

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Approximate number of entries.
    fn size(&self) -> u64;

    /// Apply pending evictions and expirations now.
    fn run_maintenance(&self) {}
}

/// Called with the key of every entry evicted for capacity.
pub type EvictionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-entry expiry: an entry lives for the TTL it was written with.
struct EntryExpiry;

impl<V> Expiry<String, CacheEntry<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// LRU local tier over a Moka cache.
///
/// - Capacity from `max_size`, least recently used entries go first
/// - Each entry expires after its own TTL
/// - `expire_after_access` adds idle expiry
/// - Cloning is cheap and shares the same underlying cache
#[derive(Clone)]
pub struct MokaLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<String, CacheEntry<V>>,
    name: Arc<str>,
}

impl<V> MokaLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a local tier with the given name and config.
    pub fn new(name: impl Into<Arc<str>>, config: &L1Config) -> Self {
        Self::with_eviction_callback(name, config, None)
    }

    /// Create a local tier that reports capacity evictions to `on_evict`.
    pub fn with_eviction_callback(
        name: impl Into<Arc<str>>,
        config: &L1Config,
        on_evict: Option<EvictionCallback>,
    ) -> Self {
        let name = name.into();
        let mut builder = Cache::builder()
            .name(&name)
            .max_capacity(config.max_size)
            .initial_capacity(config.initial_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry);

        if let Some(tti) = config.expire_after_access {
            builder = builder.time_to_idle(tti);
        }

        if let Some(on_evict) = on_evict {
            builder = builder.eviction_listener(
                move |key: Arc<String>, _value: CacheEntry<V>, cause: RemovalCause| {
                    if cause == RemovalCause::Size {
                        on_evict(key.as_str());
                    }
                },
            );
        }

        Self {
            inner: builder.build(),
            name,
        }
    }

    /// Get the name of this tier.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V> LocalTier<V> for MokaLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.get(key).filter(|entry| !entry.is_expired())
    }

    fn put(&self, key: &str, entry: CacheEntry<V>) {
        self.inner.insert(key.to_string(), entry);
    }

    fn put_if_absent(&self, key: &str, entry: CacheEntry<V>) -> bool {
        self.inner
            .entry(key.to_string())
            .or_insert_with_if(|| entry, |existing| existing.is_expired())
            .is_fresh()
    }

    fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Note: this may lag behind concurrent operations until maintenance runs.
    fn size(&self) -> u64 {
        self.inner.entry_count()
    }

    fn run_maintenance(&self) {
        self.inner.run_pending_tasks();
    }
}

impl<V> std::fmt::Debug for MokaLocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaLocalTier")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn tier(max_size: u64) -> MokaLocalTier<String> {
        MokaLocalTier::new("test", &L1Config::with_max_size(max_size))
    }

    #[test]
    fn test_put_get_invalidate() {
        let tier = tier(10);
        tier.put("a", CacheEntry::new(Some("1".to_string()), Duration::from_secs(60)));

        assert_eq!(tier.get("a").unwrap().value.as_deref(), Some("1"));
        assert!(tier.contains("a"));

        tier.invalidate("a");
        assert!(tier.get("a").is_none());
    }

    #[test]
    fn test_entry_expires_after_its_own_ttl() {
        let tier = tier(10);
        tier.put("short", CacheEntry::new(Some("1".to_string()), Duration::from_millis(20)));
        tier.put("long", CacheEntry::new(Some("2".to_string()), Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(tier.get("short").is_none());
        assert!(tier.get("long").is_some());
    }

    #[test]
    fn test_null_entries_are_hits() {
        let tier = tier(10);
        tier.put("missing", CacheEntry::new(None, Duration::from_secs(60)));

        let entry = tier.get("missing").unwrap();
        assert!(entry.is_null());
    }

    #[test]
    fn test_put_if_absent() {
        let tier = tier(10);
        let ttl = Duration::from_secs(60);
        assert!(tier.put_if_absent("a", CacheEntry::new(Some("1".to_string()), ttl)));
        assert!(!tier.put_if_absent("a", CacheEntry::new(Some("2".to_string()), ttl)));
        assert_eq!(tier.get("a").unwrap().value.as_deref(), Some("1"));
    }

    #[test]
    fn test_capacity_eviction_is_reported() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted);
        let tier: MokaLocalTier<String> = MokaLocalTier::with_eviction_callback(
            "test",
            &L1Config::with_max_size(2),
            Some(Arc::new(move |_key: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let ttl = Duration::from_secs(60);
        for key in ["o1", "o2", "o3"] {
            tier.put(key, CacheEntry::new(Some(key.to_string()), ttl));
            tier.run_maintenance();
        }
        tier.run_maintenance();

        assert!(tier.size() <= 2);
        assert!(evicted.load(Ordering::SeqCst) >= 1);
    }
}
