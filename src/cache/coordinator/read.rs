//! Read path: lookup, read-through loading and batch reads.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{CacheCoordinator, CacheValue};
use crate::error::{BoxError, CacheError};
use crate::metrics::Tier;
use crate::serialization::Payload;

/// Result of consulting the tiers for one key.
enum Lookup<V> {
    /// A tier answered. `None` is a cached absent result.
    Found(Option<V>),
    Missing,
}

impl<V> Lookup<V> {
    fn into_value(self) -> Option<V> {
        match self {
            Lookup::Found(value) => value,
            Lookup::Missing => None,
        }
    }
}

impl<V: CacheValue> CacheCoordinator<V> {
    /// Get a value, checking the local tier first and then the remote one.
    ///
    /// A remote hit is copied into the local tier. A remote failure or an
    /// open breaker reads as a miss. A remote value that cannot be decoded
    /// is returned as [`CacheError::Serialization`].
    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let started = Instant::now();
        let result = self.lookup(key).await.map(Lookup::into_value);
        self.record_latency("get", started);
        result
    }

    /// Get a value, calling `loader` on a total miss.
    ///
    /// Concurrent callers for the same key share one load: the first one
    /// runs `loader`, the rest wait and then read what it stored. A loaded
    /// value is written to both tiers; failing to store it remotely is
    /// logged but does not fail the call.
    ///
    /// With null caching enabled, a loader returning `Ok(None)` or an error
    /// caches an absent marker and the call returns `Ok(None)`. Otherwise a
    /// loader error is returned as [`CacheError::LoadFailure`].
    pub async fn get_with<F, Fut>(&self, key: &str, loader: F) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let started = Instant::now();
        let result = self.load_through(key, loader).await;
        self.record_latency("get_with", started);
        result
    }

    /// Get a value through the configured loader, or a plain
    /// [`get`](Self::get) when none is configured.
    pub async fn get_or_load(&self, key: &str) -> Result<Option<V>, CacheError> {
        match self.inner.loader.clone() {
            Some(loader) => self.get_with(key, || loader.load(key)).await,
            None => self.get(key).await,
        }
    }

    /// Get many values at once.
    ///
    /// Duplicate keys are read once. Local misses are fetched from the
    /// remote tier in chunks of `max_batch_size`; a chunk that fails or
    /// times out degrades its keys to misses. Keys still missing go to the
    /// configured loader's `load_all`, if any. Absent keys are omitted
    /// from the result, as are keys whose value fails to decode or, once
    /// loaded, to encode.
    pub async fn get_all<I, K>(&self, keys: I) -> Result<HashMap<String, V>, CacheError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.as_ref().to_string())
            .filter(|key| seen.insert(key.clone()))
            .collect();

        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            match self.local().and_then(|local| local.get(&key)) {
                Some(entry) => {
                    self.record_hit(Tier::L1);
                    if let Some(value) = entry.value {
                        found.insert(key, value);
                    }
                }
                None => {
                    if self.local().is_some() {
                        self.inner.stats.record_l1_miss();
                    }
                    missing.push(key);
                }
            }
        }

        if !missing.is_empty() && self.remote().is_some() {
            missing = self.read_remote_batch(missing, &mut found).await;
        }

        let miss_tier = self.miss_tier();
        for _ in &missing {
            self.record_miss(miss_tier);
        }

        if let Some(loader) = self.inner.loader.clone() {
            if !missing.is_empty() {
                let load_started = Instant::now();
                let loaded = loader.load_all(&missing).await;
                self.record_load(load_started.elapsed(), true);
                found.extend(self.store_loaded_batch(loaded).await);
            }
        }

        self.record_latency("get_all", started);
        Ok(found)
    }

    async fn lookup(&self, key: &str) -> Result<Lookup<V>, CacheError> {
        if let Some(local) = self.local() {
            if let Some(entry) = local.get(key) {
                let stale = self
                    .inner
                    .config
                    .l1
                    .refresh_after_write
                    .is_some_and(|after| self.remote().is_some() && entry.age() >= after);
                if stale {
                    return self.refresh(key, entry.value).await;
                }
                self.record_hit(Tier::L1);
                return Ok(Lookup::Found(entry.value));
            }
            self.inner.stats.record_l1_miss();
        }

        if self.remote().is_none() {
            self.record_miss(Tier::L1);
            return Ok(Lookup::Missing);
        }

        match self.read_remote(key).await {
            Ok(Some(value)) => {
                self.record_hit(Tier::L2);
                Ok(Lookup::Found(value))
            }
            Ok(None) => {
                self.record_miss(Tier::L2);
                Ok(Lookup::Missing)
            }
            Err(e) if e.is_remote_unavailable() => {
                debug!(cache = %self.inner.name, key = %key, error = %e, "Remote read failed, treating as miss");
                self.record_miss(Tier::L2);
                Ok(Lookup::Missing)
            }
            Err(e) => {
                self.record_miss(Tier::L2);
                Err(e)
            }
        }
    }

    /// Re-read a local entry older than `refresh_after_write`.
    ///
    /// The remote copy wins. If the remote tier cannot answer, the stale
    /// local copy is served.
    async fn refresh(&self, key: &str, stale: Option<V>) -> Result<Lookup<V>, CacheError> {
        match self.read_remote(key).await {
            Ok(Some(value)) => {
                self.record_hit(Tier::L2);
                Ok(Lookup::Found(value))
            }
            Ok(None) => {
                if let Some(local) = self.local() {
                    local.invalidate(key);
                }
                self.record_miss(Tier::L2);
                Ok(Lookup::Missing)
            }
            Err(e) if e.is_remote_unavailable() => {
                debug!(cache = %self.inner.name, key = %key, error = %e, "Refresh failed, serving stale local value");
                self.record_hit(Tier::L1);
                Ok(Lookup::Found(stale))
            }
            Err(e) => Err(e),
        }
    }

    /// Read one key from the remote tier and copy a hit into the local tier.
    ///
    /// `Ok(Some(None))` is a cached absent marker.
    async fn read_remote(&self, key: &str) -> Result<Option<Option<V>>, CacheError> {
        let Some(remote) = self.remote() else {
            return Ok(None);
        };

        let remote_key = self.remote_key(key);
        let Some(bytes) = self.guarded(remote.get(&remote_key)).await? else {
            return Ok(None);
        };

        let payload = self.inner.codec.decode(&bytes).map_err(|e| {
            error!(cache = %self.inner.name, key = %key, error = %e, "Failed to decode remote value");
            CacheError::from(e)
        })?;

        let value = self.cache_decoded(key, payload);
        Ok(Some(value))
    }

    fn cache_decoded(&self, key: &str, payload: Payload<V>) -> Option<V> {
        let value = payload.into_option();
        let (_, local_ttl) = match value {
            Some(_) => self.value_ttls(self.inner.config.default_ttl),
            None => self.null_ttls(),
        };
        self.store_local(key, value.clone(), local_ttl);
        value
    }

    async fn read_remote_batch(
        &self,
        keys: Vec<String>,
        found: &mut HashMap<String, V>,
    ) -> Vec<String> {
        let Some(remote) = self.remote() else {
            return keys;
        };

        let mut still_missing = Vec::new();
        for chunk in keys.chunks(self.batch_size()) {
            let remote_keys: Vec<String> = chunk.iter().map(|key| self.remote_key(key)).collect();
            let fetched = self
                .guarded(self.within_batch_timeout(remote.get_many(&remote_keys)))
                .await;

            let values = match fetched {
                Ok(values) => values,
                Err(e) => {
                    debug!(cache = %self.inner.name, keys = chunk.len(), error = %e, "Remote batch read failed, treating as misses");
                    still_missing.extend(chunk.iter().cloned());
                    continue;
                }
            };

            for (key, slot) in chunk.iter().zip(values) {
                let Some(bytes) = slot else {
                    still_missing.push(key.clone());
                    continue;
                };
                match self.inner.codec.decode(&bytes) {
                    Ok(payload) => {
                        self.record_hit(Tier::L2);
                        if let Some(value) = self.cache_decoded(key, payload) {
                            found.insert(key.clone(), value);
                        }
                    }
                    Err(e) => {
                        error!(cache = %self.inner.name, key = %key, error = %e, "Failed to decode remote value, skipping key");
                        self.record_miss(Tier::L2);
                    }
                }
            }
        }
        still_missing
    }

    async fn load_through<F, Fut>(&self, key: &str, loader: F) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        if let Lookup::Found(value) = self.lookup(key).await? {
            return Ok(value);
        }

        let _flight = self.inner.flight.acquire(key).await;

        // Another caller may have loaded it while we waited.
        if let Some(value) = self.recheck(key).await {
            return Ok(value);
        }

        let load_started = Instant::now();
        let outcome = loader().await;
        self.record_load(load_started.elapsed(), outcome.is_ok());

        let null_values = self.inner.config.null_values.enabled;
        match outcome {
            Ok(Some(value)) => {
                self.store_loaded(key, Some(&value)).await?;
                Ok(Some(value))
            }
            Ok(None) => {
                if null_values {
                    self.store_loaded(key, None).await?;
                }
                Ok(None)
            }
            Err(source) if null_values => {
                warn!(cache = %self.inner.name, key = %key, error = %source, "Loader failed, caching absent marker");
                self.store_loaded(key, None).await?;
                Ok(None)
            }
            Err(source) => Err(CacheError::LoadFailure {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Look again after winning the flight, without touching the counters.
    async fn recheck(&self, key: &str) -> Option<Option<V>> {
        match self.local() {
            Some(local) => local.get(key).map(|entry| entry.value),
            None => self.read_remote(key).await.ok().flatten(),
        }
    }

    /// Store a loaded value (or absent marker) in both tiers.
    ///
    /// Only encoding failures are returned; the remote write is a single
    /// best-effort attempt.
    async fn store_loaded(&self, key: &str, value: Option<&V>) -> Result<(), CacheError> {
        let (remote_ttl, local_ttl) = match value {
            Some(_) => self.value_ttls(self.inner.config.l2.default_ttl),
            None => self.null_ttls(),
        };

        if let Some(remote) = self.remote() {
            let bytes = self.inner.codec.encode_payload(value)?;
            let remote_key = self.remote_key(key);
            if let Err(e) = self.guarded(remote.put(&remote_key, bytes, remote_ttl)).await {
                warn!(cache = %self.inner.name, key = %key, error = %e, "Failed to store loaded value remotely");
            }
        }

        self.store_local(key, value.cloned(), local_ttl);
        Ok(())
    }

    /// Store a loaded batch in both tiers and return what was stored.
    ///
    /// A value that fails to encode is logged and left out, so the rest of
    /// the batch still resolves. Remote writes are best-effort.
    async fn store_loaded_batch(&self, loaded: HashMap<String, V>) -> HashMap<String, V> {
        if loaded.is_empty() {
            return loaded;
        }
        let (remote_ttl, local_ttl) = self.value_ttls(self.inner.config.l2.default_ttl);

        let mut stored = HashMap::with_capacity(loaded.len());
        let mut encoded = Vec::with_capacity(loaded.len());
        for (key, value) in loaded {
            if self.remote().is_some() {
                match self.inner.codec.encode(&value) {
                    Ok(bytes) => encoded.push((self.remote_key(&key), bytes)),
                    Err(e) => {
                        error!(cache = %self.inner.name, key = %key, error = %e, "Failed to encode loaded value, skipping key");
                        continue;
                    }
                }
            }
            stored.insert(key, value);
        }

        if let Some(remote) = self.remote() {
            for chunk in encoded.chunks(self.batch_size()) {
                let written = self
                    .guarded(self.within_batch_timeout(remote.put_many(chunk.to_vec(), remote_ttl)))
                    .await;
                if let Err(e) = written {
                    warn!(cache = %self.inner.name, keys = chunk.len(), error = %e, "Failed to store loaded batch remotely");
                }
            }
        }

        for (key, value) in &stored {
            self.store_local(key, Some(value.clone()), local_ttl);
        }
        stored
    }
}
