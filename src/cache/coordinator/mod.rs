//! Two-tier cache coordinator.
//!
//! A [`CacheCoordinator`] presents one logical cache over a local tier
//! and a remote tier:
//!
//! ```text
//! get:  L1 ──miss──▶ breaker ─▶ L2 ──miss──▶ loader
//!        ▲                      │             │
//!        └──── populate ────────┴─────────────┘
//!
//! put:  writer ─▶ breaker ─▶ L2 ─▶ L1 ─▶ publish {evict}
//! ```
//!
//! ## Failure policy
//!
//! - Reads fail open: a remote failure or an open breaker reads as a miss
//! - Writes fail closed: a remote failure rejects the whole write and the
//!   local copy is dropped, unless [`WriteMode::WriteBehind`] is chosen
//! - Undecodable remote values are reported, never treated as misses
//!
//! Cloning is cheap; clones share all state.

mod read;
mod write;


use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::config::{CacheConfig, WriteMode};
use super::flight::SingleFlight;
use super::loader::{CacheLoader, CacheWriter};
use super::local::{CacheEntry, EvictionCallback, LocalTier, MokaLocalTier};
use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::error::CacheError;
use crate::metrics::{DefaultMetricsCollector, MetricsCollector, Tier};
use crate::remote::{RemoteError, RemoteTier};
use crate::resilience::{BreakerError, CircuitBreaker, ResilienceConfig, RetryConfig, RetryPolicy};
use crate::serialization::{JsonSerializer, Serializer, ValueCodec};
use crate::sync::{InvalidationBus, InvalidationKind, InvalidationMessage};

/// Bounds every cached value type satisfies.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

struct Inner<V: CacheValue> {
    name: String,
    node_id: Arc<str>,
    config: CacheConfig,
    local: Option<Arc<dyn LocalTier<V>>>,
    remote: Option<Arc<dyn RemoteTier>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    bus: Option<Arc<dyn InvalidationBus>>,
    metrics: Arc<dyn MetricsCollector>,
    stats: Arc<CacheStats>,
    codec: ValueCodec<V>,
    loader: Option<Arc<dyn CacheLoader<V>>>,
    writer: Option<Arc<dyn CacheWriter<V>>>,
    flight: SingleFlight,
}

/// One logical cache spanning the local and remote tiers.
pub struct CacheCoordinator<V: CacheValue> {
    inner: Arc<Inner<V>>,
}

impl<V: CacheValue> Clone for CacheCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheCoordinator<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Start building a coordinator that stores JSON in the remote tier.
    pub fn builder(name: impl Into<String>) -> CoordinatorBuilder<V> {
        CoordinatorBuilder::new(name, Arc::new(JsonSerializer::<V>::new()))
    }
}

impl<V: CacheValue> CacheCoordinator<V> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Content type of remote payloads.
    pub fn content_type(&self) -> &'static str {
        self.inner.codec.content_type()
    }

    /// Check if a live, non-null value is held locally. Never touches the
    /// remote tier.
    pub fn contains_key(&self, key: &str) -> bool {
        self.local()
            .and_then(|local| local.get(key))
            .is_some_and(|entry| !entry.is_null())
    }

    /// Approximate number of local entries.
    pub fn size(&self) -> u64 {
        self.local().map_or(0, |local| local.size())
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot(self.size())
    }

    /// Zero the counters. Cached entries are untouched.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Apply pending local evictions and expirations now.
    pub fn run_maintenance(&self) {
        if let Some(local) = self.local() {
            local.run_maintenance();
        }
    }

    /// Evict local entries named by a peer's invalidation.
    ///
    /// Messages for other caches or published by this node are ignored.
    /// Evicting a key that is already gone is a no-op.
    pub fn apply_invalidation(&self, message: &InvalidationMessage) {
        if message.cache_name != self.inner.name || message.is_from(&self.inner.node_id) {
            return;
        }
        let Some(local) = self.local() else {
            return;
        };

        match message.kind {
            InvalidationKind::Evict | InvalidationKind::BulkEvict => {
                for key in message.keys() {
                    local.invalidate(key);
                }
            }
            InvalidationKind::Clear => local.invalidate_all(),
        }

        debug!(
            cache = %self.inner.name,
            origin = %message.origin_id,
            kind = ?message.kind,
            keys = message.keys().len(),
            "Applied remote invalidation"
        );
    }

    /// Drop every local entry without touching the remote tier or peers.
    pub fn clear_local(&self) {
        if let Some(local) = self.local() {
            local.invalidate_all();
        }
    }

    /// Run [`get`](Self::get) on the runtime.
    ///
    /// Aborting the handle drops the in-flight remote call; the local tier
    /// is only populated once a remote read has fully completed.
    pub fn spawn_get(&self, key: impl Into<String>) -> JoinHandle<Result<Option<V>, CacheError>> {
        let this = self.clone();
        let key = key.into();
        tokio::spawn(async move { this.get(&key).await })
    }

    /// Run [`put`](Self::put) on the runtime.
    pub fn spawn_put(&self, key: impl Into<String>, value: V) -> JoinHandle<Result<(), CacheError>> {
        let this = self.clone();
        let key = key.into();
        tokio::spawn(async move { this.put(&key, value).await })
    }

    /// Run [`remove`](Self::remove) on the runtime.
    pub fn spawn_remove(&self, key: impl Into<String>) -> JoinHandle<Result<bool, CacheError>> {
        let this = self.clone();
        let key = key.into();
        tokio::spawn(async move { this.remove(&key).await })
    }

    fn local(&self) -> Option<&dyn LocalTier<V>> {
        self.inner.local.as_deref()
    }

    fn remote(&self) -> Option<&dyn RemoteTier> {
        self.inner.remote.as_deref()
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.remote_prefix(), key)
    }

    fn remote_prefix(&self) -> String {
        format!("{}{}:", self.inner.config.l2.key_prefix, self.inner.name)
    }

    fn is_write_behind(&self) -> bool {
        self.inner.config.write_mode == WriteMode::WriteBehind
    }

    fn value_ttls(&self, remote_ttl: Duration) -> (Duration, Duration) {
        (remote_ttl, self.inner.config.local_ttl(remote_ttl))
    }

    fn null_ttls(&self) -> (Duration, Duration) {
        let ttl = self.inner.config.null_values.ttl;
        (ttl, self.inner.config.local_ttl(ttl))
    }

    fn store_local(&self, key: &str, value: Option<V>, ttl: Duration) {
        if let Some(local) = self.local() {
            local.put(key, CacheEntry::new(value, ttl));
        }
    }

    /// Run one remote call through the breaker.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, CacheError> {
        match self.inner.breaker.execute(|| call).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open) => {
                Err(CacheError::CircuitOpen(self.inner.breaker.name().to_string()))
            }
            Err(BreakerError::Inner(e)) => Err(CacheError::RemoteUnavailable(e)),
        }
    }

    /// Run a remote write through the breaker, retrying transport failures.
    async fn guarded_write<T, F, Fut>(&self, mut op: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.inner
            .retry
            .run(|| self.guarded(op()), CacheError::is_retryable)
            .await
    }

    /// Bound a batch round trip by the configured batch timeout.
    async fn within_batch_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let limit = self.inner.config.l2.batch.batch_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout(limit)))
    }

    fn batch_size(&self) -> usize {
        self.inner.config.l2.batch.max_batch_size.max(1)
    }

    async fn publish(&self, message: InvalidationMessage) {
        let Some(bus) = &self.inner.bus else {
            return;
        };
        if let Err(e) = bus.publish(message).await {
            warn!(cache = %self.inner.name, error = %e, "Failed to publish invalidation");
        }
    }

    fn record_hit(&self, tier: Tier) {
        match tier {
            Tier::L1 => self.inner.stats.record_l1_hit(),
            Tier::L2 => self.inner.stats.record_l2_hit(),
        }
        self.inner.metrics.record_hit(&self.inner.name, tier);
    }

    fn record_miss(&self, tier: Tier) {
        if tier == Tier::L2 {
            self.inner.stats.record_l2_miss();
        }
        self.inner.stats.record_miss();
        self.inner.metrics.record_miss(&self.inner.name, tier);
    }

    /// Tier a total miss is attributed to.
    fn miss_tier(&self) -> Tier {
        if self.remote().is_some() { Tier::L2 } else { Tier::L1 }
    }

    fn record_load(&self, elapsed: Duration, success: bool) {
        self.inner.stats.record_load(elapsed, success);
        self.inner.metrics.record_load(&self.inner.name, elapsed, success);
    }

    fn record_puts(&self, count: u64) {
        self.inner.stats.record_puts(count);
        for _ in 0..count {
            self.inner.metrics.record_put(&self.inner.name);
        }
        self.inner
            .metrics
            .update_size(&self.inner.name, Tier::L1, self.size());
    }

    fn record_removes(&self, count: u64) {
        self.inner.stats.record_removes(count);
        for _ in 0..count {
            self.inner.metrics.record_remove(&self.inner.name);
        }
        self.inner
            .metrics
            .update_size(&self.inner.name, Tier::L1, self.size());
    }

    fn record_latency(&self, operation: &'static str, started: Instant) {
        self.inner
            .metrics
            .record_latency(&self.inner.name, operation, started.elapsed());
    }
}

impl<V: CacheValue> std::fmt::Debug for CacheCoordinator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("name", &self.inner.name)
            .field("node_id", &self.inner.node_id)
            .field("l1", &self.inner.local.is_some())
            .field("l2", &self.inner.remote.is_some())
            .field("size", &self.size())
            .finish()
    }
}

/// Builder for [`CacheCoordinator`].
///
/// Only the name and serializer are required. Without a remote tier the
/// cache is local-only; without a bus no invalidations are published.
pub struct CoordinatorBuilder<V: CacheValue> {
    name: String,
    config: CacheConfig,
    node_id: Option<Arc<str>>,
    serializer: Arc<dyn Serializer<V>>,
    local: Option<Arc<dyn LocalTier<V>>>,
    remote: Option<Arc<dyn RemoteTier>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: RetryConfig,
    metrics: Option<Arc<dyn MetricsCollector>>,
    loader: Option<Arc<dyn CacheLoader<V>>>,
    writer: Option<Arc<dyn CacheWriter<V>>>,
}

impl<V: CacheValue> CoordinatorBuilder<V> {
    pub fn new(name: impl Into<String>, serializer: Arc<dyn Serializer<V>>) -> Self {
        Self {
            name: name.into(),
            config: CacheConfig::default(),
            node_id: None,
            serializer,
            local: None,
            remote: None,
            bus: None,
            breaker: None,
            retry: RetryConfig::default(),
            metrics: None,
            loader: None,
            writer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<Arc<str>>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Use a custom local tier instead of the Moka one.
    #[must_use]
    pub fn local_tier(mut self, local: Arc<dyn LocalTier<V>>) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteTier>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share a breaker with other caches using the same remote tier.
    #[must_use]
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn CacheLoader<V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[must_use]
    pub fn writer(mut self, writer: Arc<dyn CacheWriter<V>>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn build(self) -> CacheCoordinator<V> {
        let CoordinatorBuilder {
            name,
            config,
            node_id,
            serializer,
            local,
            remote,
            bus,
            breaker,
            retry,
            metrics,
            loader,
            writer,
        } = self;

        let metrics: Arc<dyn MetricsCollector> =
            metrics.unwrap_or_else(|| Arc::new(DefaultMetricsCollector::new()));
        let stats = Arc::new(CacheStats::new(config.statistics_enabled));

        let local = if config.l1.enabled {
            local.or_else(|| {
                let on_evict = eviction_callback(&name, &metrics, &stats);
                Some(Arc::new(MokaLocalTier::<V>::with_eviction_callback(
                    name.as_str(),
                    &config.l1,
                    Some(on_evict),
                )) as Arc<dyn LocalTier<V>>)
            })
        } else {
            None
        };

        let remote = if config.l2.enabled { remote } else { None };
        let bus = if config.sync_enabled { bus } else { None };
        let breaker = breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                format!("{name}-remote"),
                ResilienceConfig::default(),
            ))
        });
        let node_id = node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string().into());
        let codec = ValueCodec::new(serializer, config.l2.compression.clone());

        debug!(
            cache = %name,
            l1 = local.is_some(),
            l2 = remote.is_some(),
            sync = bus.is_some(),
            write_mode = ?config.write_mode,
            "Creating cache coordinator"
        );

        CacheCoordinator {
            inner: Arc::new(Inner {
                name,
                node_id,
                config,
                local,
                remote,
                breaker,
                retry: RetryPolicy::new(retry),
                bus,
                metrics,
                stats,
                codec,
                loader,
                writer,
                flight: SingleFlight::new(),
            }),
        }
    }
}

fn eviction_callback(
    name: &str,
    metrics: &Arc<dyn MetricsCollector>,
    stats: &Arc<CacheStats>,
) -> EvictionCallback {
    let name = name.to_string();
    let metrics = Arc::clone(metrics);
    let stats = Arc::clone(stats);
    Arc::new(move |key: &str| {
        stats.record_eviction();
        metrics.record_eviction(&name, Tier::L1);
        trace!(cache = %name, key = %key, "Evicted from local tier");
    })
}
