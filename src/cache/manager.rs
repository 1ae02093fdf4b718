//! Cache manager - owns the shared tiers and every named coordinator.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::config::{CacheConfig, L1Config, L2Config};
use super::coordinator::{CacheCoordinator, CacheValue, CoordinatorBuilder};
use super::stats::CacheStatsSnapshot;
use crate::error::CacheError;
use crate::metrics::{DefaultMetricsCollector, MetricsCollector};
use crate::remote::{RemoteError, RemoteTier};
use crate::resilience::{CircuitBreaker, ResilienceConfig, RetryConfig};
use crate::sync::{InvalidationBus, InvalidationListener, InvalidationMessage, SubscriptionId};

/// Type-erased view of a coordinator, used for routing and reporting.
trait ManagedCache: Send + Sync {
    fn apply_invalidation(&self, message: &InvalidationMessage);

    fn stats(&self) -> CacheStatsSnapshot;

    fn clear_local(&self);
}

impl<V: CacheValue> ManagedCache for CacheCoordinator<V> {
    fn apply_invalidation(&self, message: &InvalidationMessage) {
        CacheCoordinator::apply_invalidation(self, message);
    }

    fn stats(&self) -> CacheStatsSnapshot {
        CacheCoordinator::stats(self)
    }

    fn clear_local(&self) {
        CacheCoordinator::clear_local(self);
    }
}

/// A registered coordinator with its value type.
struct Registered {
    cache: Box<dyn Any + Send + Sync>,
    handle: Arc<dyn ManagedCache>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Registered {
    fn new<V: CacheValue>(cache: CacheCoordinator<V>) -> Self {
        Self {
            handle: Arc::new(cache.clone()),
            cache: Box::new(cache),
            type_id: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
        }
    }

    fn typed<V: CacheValue>(&self, name: &str) -> Result<CacheCoordinator<V>, CacheError> {
        let mismatch = || CacheError::TypeMismatch {
            name: name.to_string(),
            registered: self.type_name,
            requested: std::any::type_name::<V>(),
        };
        if self.type_id != TypeId::of::<V>() {
            return Err(mismatch());
        }
        self.cache
            .downcast_ref::<CacheCoordinator<V>>()
            .cloned()
            .ok_or_else(mismatch)
    }
}

struct ManagerInner {
    node_id: Arc<str>,
    remote: Option<Arc<dyn RemoteTier>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    metrics: Arc<dyn MetricsCollector>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    defaults: CacheConfig,
    caches: RwLock<HashMap<String, Registered>>,
    subscription: Mutex<Option<SubscriptionId>>,
    shut_down: AtomicBool,
}

impl ManagerInner {
    fn route(&self, message: &InvalidationMessage) {
        if message.is_from(&self.node_id) {
            return;
        }
        let handle = self
            .caches
            .read()
            .get(&message.cache_name)
            .map(|registered| Arc::clone(&registered.handle));

        match handle {
            Some(handle) => handle.apply_invalidation(message),
            None => debug!(cache = %message.cache_name, "Invalidation for unknown cache ignored"),
        }
    }
}

/// Forwards bus messages to the coordinator they name.
///
/// Holds the manager weakly: the bus keeps its listeners alive, and the
/// manager keeps the bus alive.
struct Router {
    manager: Weak<ManagerInner>,
}

impl InvalidationListener for Router {
    fn on_message(&self, message: &InvalidationMessage) {
        if let Some(manager) = self.manager.upgrade() {
            manager.route(message);
        }
    }
}

/// Central registry for the coordinators of one node.
///
/// Every cache created by a manager shares its remote tier, bus, metrics
/// sink and circuit breaker. Construct one per process and pass it
/// around; cloning is cheap.
///
/// ## Example
///
/// ```rust,ignore
/// let manager = CacheManager::builder()
///     .remote(Arc::new(RedisRemoteTier::connect(url).await?))
///     .bus(Arc::new(RedisBus::connect(url, DEFAULT_CHANNEL).await?))
///     .build();
/// manager.start().await?;
///
/// let orders = manager.get_cache::<Order>("orders")?;
/// orders.put("o1", order).await?;
/// ```
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Breaker guarding the shared remote tier.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.inner.metrics
    }

    /// Subscribe to the bus and start delivery. Idempotent.
    pub async fn start(&self) -> Result<(), CacheError> {
        self.ensure_running()?;
        let Some(bus) = &self.inner.bus else {
            return Ok(());
        };

        {
            let mut subscription = self.inner.subscription.lock();
            if subscription.is_none() {
                let router = Router {
                    manager: Arc::downgrade(&self.inner),
                };
                *subscription = Some(bus.subscribe(Arc::new(router)));
            }
        }

        bus.start()
            .await
            .map_err(|e| CacheError::RemoteUnavailable(RemoteError::transport(e.to_string())))?;
        info!(node = %self.inner.node_id, "Cache manager started");
        Ok(())
    }

    /// Get or create a cache with the manager's default config.
    pub fn get_cache<V>(&self, name: &str) -> Result<CacheCoordinator<V>, CacheError>
    where
        V: CacheValue + Serialize + DeserializeOwned,
    {
        self.get_cache_with(name, self.inner.defaults.clone())
    }

    /// Get or create a cache. `config` only applies when the cache is
    /// created by this call.
    ///
    /// Fails with [`CacheError::TypeMismatch`] if `name` is registered
    /// with another value type.
    pub fn get_cache_with<V>(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> Result<CacheCoordinator<V>, CacheError>
    where
        V: CacheValue + Serialize + DeserializeOwned,
    {
        if let Some(cache) = self.get_cache_if_present(name)? {
            return Ok(cache);
        }
        self.get_cache_from(CacheCoordinator::<V>::builder(name).config(config))
    }

    /// Coordinator builder pre-filled with the manager's default config,
    /// for [`get_cache_from`](Self::get_cache_from).
    pub fn cache_builder<V>(&self, name: &str) -> CoordinatorBuilder<V>
    where
        V: CacheValue + Serialize + DeserializeOwned,
    {
        CacheCoordinator::<V>::builder(name).config(self.inner.defaults.clone())
    }

    /// Get or create a cache from a configured builder.
    ///
    /// This is how a managed cache gets its own loader, writer, serializer
    /// or local tier. The manager's node id, breaker, retry policy and
    /// metrics sink, and its remote tier and bus when it has them, replace
    /// whatever the builder carries. The builder only applies when the
    /// cache is created by this call.
    ///
    /// ```rust,ignore
    /// let orders = manager.get_cache_from(
    ///     manager.cache_builder::<Order>("orders").loader(Arc::new(loader)),
    /// )?;
    /// ```
    pub fn get_cache_from<V>(
        &self,
        builder: CoordinatorBuilder<V>,
    ) -> Result<CacheCoordinator<V>, CacheError>
    where
        V: CacheValue,
    {
        let name = builder.name().to_string();
        if let Some(cache) = self.get_cache_if_present(&name)? {
            return Ok(cache);
        }

        let mut caches = self.inner.caches.write();
        // Lost a race with another creator.
        if let Some(existing) = caches.get(&name) {
            return existing.typed(&name);
        }

        debug!(cache = %name, "Creating cache");
        let cache = self.share_with(builder).build();
        caches.insert(name, Registered::new(cache.clone()));
        Ok(cache)
    }

    /// Get a cache only if it exists.
    pub fn get_cache_if_present<V>(
        &self,
        name: &str,
    ) -> Result<Option<CacheCoordinator<V>>, CacheError>
    where
        V: CacheValue,
    {
        self.ensure_running()?;
        self.inner
            .caches
            .read()
            .get(name)
            .map(|registered| registered.typed(name))
            .transpose()
    }

    /// Names of every registered cache, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Unregister a cache and drop its local entries.
    ///
    /// Handles already given out keep working but no longer receive
    /// invalidations. Returns `true` if the cache existed.
    pub fn destroy_cache(&self, name: &str) -> bool {
        let removed = self.inner.caches.write().remove(name);
        match removed {
            Some(registered) => {
                registered.handle.clear_local();
                debug!(cache = %name, "Destroyed cache");
                true
            }
            None => false,
        }
    }

    /// Statistics of every registered cache.
    pub fn all_stats(&self) -> HashMap<String, CacheStatsSnapshot> {
        self.inner
            .caches
            .read()
            .iter()
            .map(|(name, registered)| (name.clone(), registered.handle.stats()))
            .collect()
    }

    /// Stop the bus and drop every cache. Later lookups fail with
    /// [`CacheError::ShutDown`]. Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(bus) = &self.inner.bus {
            let subscription = self.inner.subscription.lock().take();
            if let Some(id) = subscription {
                bus.unsubscribe(id);
            }
            bus.stop().await;
        }

        let dropped: Vec<Registered> = self.inner.caches.write().drain().map(|(_, r)| r).collect();
        for registered in &dropped {
            registered.handle.clear_local();
        }
        info!(node = %self.inner.node_id, caches = dropped.len(), "Cache manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), CacheError> {
        if self.is_shut_down() {
            warn!(node = %self.inner.node_id, "Cache manager used after shutdown");
            return Err(CacheError::ShutDown);
        }
        Ok(())
    }

    /// Attach the pieces every cache of this manager shares.
    fn share_with<V: CacheValue>(&self, builder: CoordinatorBuilder<V>) -> CoordinatorBuilder<V> {
        let inner = &self.inner;
        let mut builder = builder
            .node_id(Arc::clone(&inner.node_id))
            .breaker(Arc::clone(&inner.breaker))
            .retry(inner.retry.clone())
            .metrics(Arc::clone(&inner.metrics));

        if let Some(remote) = &inner.remote {
            builder = builder.remote(Arc::clone(remote));
        }
        if let Some(bus) = &inner.bus {
            builder = builder.bus(Arc::clone(bus));
        }
        builder
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("node_id", &self.inner.node_id)
            .field("cache_names", &self.cache_names())
            .field("breaker", &self.inner.breaker.state())
            .finish()
    }
}

/// Builder for [`CacheManager`].
#[derive(Default)]
pub struct CacheManagerBuilder {
    node_id: Option<String>,
    remote: Option<Arc<dyn RemoteTier>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    resilience: ResilienceConfig,
    retry: RetryConfig,
    defaults: CacheConfig,
}

impl CacheManagerBuilder {
    /// Identity stamped on published invalidations. Generated if unset.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
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

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Config used by [`CacheManager::get_cache`].
    #[must_use]
    pub fn defaults(mut self, defaults: CacheConfig) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.defaults.default_ttl = ttl;
        self
    }

    #[must_use]
    pub fn l1(mut self, l1: L1Config) -> Self {
        self.defaults.l1 = l1;
        self
    }

    #[must_use]
    pub fn l2(mut self, l2: L2Config) -> Self {
        self.defaults.l2 = l2;
        self
    }

    pub fn build(self) -> CacheManager {
        let node_id: Arc<str> = self
            .node_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            .into();
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(DefaultMetricsCollector::new()));
        let breaker = Arc::new(CircuitBreaker::new("remote-tier", self.resilience));

        info!(
            node = %node_id,
            remote = self.remote.is_some(),
            bus = self.bus.is_some(),
            "Cache manager initialized"
        );

        CacheManager {
            inner: Arc::new(ManagerInner {
                node_id,
                remote: self.remote,
                bus: self.bus,
                metrics,
                breaker,
                retry: self.retry,
                defaults: self.defaults,
                caches: RwLock::new(HashMap::new()),
                subscription: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::FnLoader;
    use crate::error::BoxError;
    use crate::remote::InMemoryRemoteTier;
    use crate::resilience::CircuitState;
    use crate::sync::MemoryBroker;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        total: u32,
    }

    fn order(id: &str, total: u32) -> Order {
        Order {
            id: id.to_string(),
            total,
        }
    }

    async fn node(node_id: &str, remote: &InMemoryRemoteTier, broker: &MemoryBroker) -> CacheManager {
        let manager = CacheManager::builder()
            .node_id(node_id)
            .remote(Arc::new(remote.clone()))
            .bus(Arc::new(broker.bus()))
            .retry(RetryConfig::disabled())
            .build();
        manager.start().await.unwrap();
        manager
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_get_cache_returns_shared_instance() {
        let manager = CacheManager::builder().build();

        let first = manager.get_cache::<Order>("orders").unwrap();
        first.put("o1", order("o1", 1)).await.unwrap();

        let second = manager.get_cache::<Order>("orders").unwrap();
        assert!(second.contains_key("o1"));
        assert_eq!(manager.cache_names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let manager = CacheManager::builder().build();
        manager.get_cache::<Order>("orders").unwrap();

        let err = manager.get_cache::<String>("orders").unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { ref name, .. } if name == "orders"));
        assert!(manager.get_cache_if_present::<u64>("orders").is_err());
    }

    #[tokio::test]
    async fn test_get_cache_if_present() {
        let manager = CacheManager::builder().build();
        assert!(manager.get_cache_if_present::<Order>("orders").unwrap().is_none());

        manager.get_cache::<Order>("orders").unwrap();
        assert!(manager.get_cache_if_present::<Order>("orders").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_managed_cache_loads_through_its_loader() {
        let remote = InMemoryRemoteTier::new();
        let manager = CacheManager::builder()
            .remote(Arc::new(remote.clone()))
            .build();

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let loader: FnLoader<_, Order> = FnLoader::new(move |key: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(Some(Order { id: key, total: 3 }))
            }
        });

        let orders = manager
            .get_cache_from(manager.cache_builder::<Order>("orders").loader(Arc::new(loader)))
            .unwrap();

        assert_eq!(orders.get_or_load("o1").await.unwrap(), Some(order("o1", 3)));
        assert_eq!(orders.get_or_load("o1").await.unwrap(), Some(order("o1", 3)));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(remote.contains("cache:orders:o1"));

        assert_eq!(orders.get_all(["o2", "o3"]).await.unwrap().len(), 2);

        // Looking the cache up by name returns the one built with the loader.
        let again = manager.get_cache::<Order>("orders").unwrap();
        assert_eq!(again.get_or_load("o4").await.unwrap(), Some(order("o4", 3)));
        assert_eq!(loads.load(Ordering::SeqCst), 4);
        assert!(orders.stats().load_successes >= 2);
    }

    #[tokio::test]
    async fn test_destroy_cache_clears_local_entries() {
        let manager = CacheManager::builder().build();
        let orders = manager.get_cache::<Order>("orders").unwrap();
        orders.put("o1", order("o1", 1)).await.unwrap();

        assert!(manager.destroy_cache("orders"));
        assert!(!manager.destroy_cache("orders"));
        assert!(!orders.contains_key("o1"));
        assert!(manager.cache_names().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_later_lookups() {
        let remote = InMemoryRemoteTier::new();
        let broker = MemoryBroker::new();
        let manager = node("node-a", &remote, &broker).await;
        manager.get_cache::<Order>("orders").unwrap();

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert!(matches!(
            manager.get_cache::<Order>("orders"),
            Err(CacheError::ShutDown)
        ));
        assert!(matches!(manager.start().await, Err(CacheError::ShutDown)));
        assert!(manager.all_stats().is_empty());
    }

    #[tokio::test]
    async fn test_all_stats_reports_every_cache() {
        let manager = CacheManager::builder().build();
        let orders = manager.get_cache::<Order>("orders").unwrap();
        let users = manager.get_cache::<String>("users").unwrap();

        orders.put("o1", order("o1", 1)).await.unwrap();
        orders.get("o1").await.unwrap();
        users.get("u1").await.unwrap();

        let stats = manager.all_stats();
        assert_eq!(stats["orders"].hits, 1);
        assert_eq!(stats["users"].misses, 1);
    }

    #[tokio::test]
    async fn test_peer_writes_invalidate_local_copies() {
        let remote = InMemoryRemoteTier::new();
        let broker = MemoryBroker::new();
        let a = node("node-a", &remote, &broker).await;
        let b = node("node-b", &remote, &broker).await;

        let orders_a = a.get_cache::<Order>("orders").unwrap();
        let orders_b = b.get_cache::<Order>("orders").unwrap();

        orders_a.put("o1", order("o1", 1)).await.unwrap();
        assert_eq!(orders_b.get("o1").await.unwrap(), Some(order("o1", 1)));

        orders_a.put("o1", order("o1", 2)).await.unwrap();
        settle().await;
        assert_eq!(orders_b.get("o1").await.unwrap(), Some(order("o1", 2)));

        orders_b.remove("o1").await.unwrap();
        settle().await;
        assert!(!orders_a.contains_key("o1"));
        assert_eq!(orders_a.get("o1").await.unwrap(), None);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidations_are_routed_by_cache_name() {
        let remote = InMemoryRemoteTier::new();
        let broker = MemoryBroker::new();
        let a = node("node-a", &remote, &broker).await;
        let b = node("node-b", &remote, &broker).await;

        let orders_b = b.get_cache::<Order>("orders").unwrap();
        let users_b = b.get_cache::<Order>("users").unwrap();
        orders_b.put("k", order("k", 1)).await.unwrap();
        users_b.put("k", order("k", 1)).await.unwrap();

        a.get_cache::<Order>("orders").unwrap().clear().await.unwrap();
        settle().await;

        assert!(!orders_b.contains_key("k"));
        assert!(users_b.contains_key("k"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_size_evicted_entry_still_served_from_remote() {
        let remote = InMemoryRemoteTier::new();
        let manager = CacheManager::builder()
            .remote(Arc::new(remote.clone()))
            .build();
        let config = CacheConfig::default()
            .default_ttl(Duration::from_secs(10))
            .l1(L1Config::with_max_size(2));
        let orders = manager.get_cache_with::<Order>("orders", config).unwrap();

        for id in ["o1", "o2", "o3"] {
            orders.put(id, order(id, 1)).await.unwrap();
            orders.run_maintenance();
        }

        assert!(!orders.contains_key("o1"));
        assert_eq!(orders.get("o1").await.unwrap(), Some(order("o1", 1)));
        assert!(orders.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_caches_share_one_breaker() {
        let remote = InMemoryRemoteTier::new();
        let manager = CacheManager::builder()
            .remote(Arc::new(remote.clone()))
            .retry(RetryConfig::disabled())
            .resilience(ResilienceConfig::default().failure_threshold(2))
            .build();
        let orders = manager.get_cache::<Order>("orders").unwrap();
        let users = manager.get_cache::<Order>("users").unwrap();
        remote.set_available(false);

        assert!(orders.put("o1", order("o1", 1)).await.is_err());
        assert!(users.put("u1", order("u1", 1)).await.is_err());

        assert_eq!(manager.breaker().state(), CircuitState::Open);
        assert!(matches!(
            orders.put("o2", order("o2", 1)).await,
            Err(CacheError::CircuitOpen(_))
        ));
    }
}
