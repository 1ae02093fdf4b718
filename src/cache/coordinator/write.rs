//! Write path: puts, removals and clears.
//!
//! Write-through mutations reach the writer and the remote tier before the
//! local tier, so a rejected write never leaves a local copy behind.
//! Write-behind mutations update the local tier at once and push the rest
//! from a background task.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{CacheCoordinator, CacheValue};
use crate::cache::local::CacheEntry;
use crate::error::CacheError;
use crate::metrics::Tier;
use crate::sync::InvalidationMessage;

impl<V: CacheValue> CacheCoordinator<V> {
    /// Store a value with the remote tier's default TTL.
    pub async fn put(&self, key: &str, value: V) -> Result<(), CacheError> {
        let started = Instant::now();
        let remote_ttl = self.inner.config.l2.default_ttl;
        let local_ttl = self.inner.config.local_ttl(self.inner.config.default_ttl);
        let result = self.write_one(key, value, remote_ttl, local_ttl).await;
        self.record_latency("put", started);
        result
    }

    /// Store a value that expires after `ttl`.
    ///
    /// The local copy never outlives the remote one. A zero TTL removes
    /// the key instead.
    pub async fn put_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return self.remove(key).await.map(|_| ());
        }
        let started = Instant::now();
        let (remote_ttl, local_ttl) = self.value_ttls(ttl);
        let result = self.write_one(key, value, remote_ttl, local_ttl).await;
        self.record_latency("put", started);
        result
    }

    /// Store a value only if no live value exists for `key`.
    ///
    /// The remote tier decides, so two nodes racing on the same key
    /// agree on one winner. Returns `true` if this call stored the value.
    /// Always runs synchronously, whatever the write mode. If the writer
    /// rejects the value, the insert is taken back and the error returned.
    pub async fn put_if_absent(&self, key: &str, value: V) -> Result<bool, CacheError> {
        self.put_if_absent_with_ttl(key, value, self.inner.config.l2.default_ttl)
            .await
    }

    /// [`put_if_absent`](Self::put_if_absent) with an explicit TTL. A zero
    /// TTL stores nothing and returns `false`.
    pub async fn put_if_absent_with_ttl(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let started = Instant::now();
        let (remote_ttl, local_ttl) = self.value_ttls(ttl);

        let applied = match self.remote() {
            Some(remote) => {
                let bytes = self.inner.codec.encode(&value)?;
                let remote_key = self.remote_key(key);
                self.guarded_write(|| remote.put_if_absent(&remote_key, bytes.clone(), remote_ttl))
                    .await?
            }
            None => self.local().is_some_and(|local| {
                local.put_if_absent(key, CacheEntry::new(Some(value.clone()), local_ttl))
            }),
        };

        if applied {
            if let Some(writer) = &self.inner.writer {
                if let Err(e) = writer.write(key, &value).await {
                    self.undo_insert(key).await;
                    return Err(CacheError::Writer(e));
                }
            }
            if self.remote().is_some() {
                self.store_local(key, Some(value), local_ttl);
            }
            self.record_puts(1);
            self.publish_evict(key).await;
        }

        self.record_latency("put_if_absent", started);
        Ok(applied)
    }

    /// Store many values with the remote tier's default TTL.
    ///
    /// Remote writes are pipelined in chunks of `max_batch_size`. In
    /// write-through mode a failed chunk fails the call and drops every
    /// local copy of the batch; chunks already written stay written.
    pub async fn put_all<I, K>(&self, entries: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        let entries: Vec<(String, V)> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let (remote_ttl, local_ttl) = self.value_ttls(self.inner.config.l2.default_ttl);

        let encoded = match self.remote() {
            Some(_) => {
                let mut encoded = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    encoded.push((self.remote_key(key), self.inner.codec.encode(value)?));
                }
                Some(encoded)
            }
            None => None,
        };

        if self.is_write_behind() {
            for (key, value) in &entries {
                self.store_local(key, Some(value.clone()), local_ttl);
            }
            let this = self.clone();
            let pending = entries.clone();
            tokio::spawn(async move { this.put_all_behind(pending, encoded, remote_ttl).await });
        } else {
            if let Some(writer) = &self.inner.writer {
                writer.write_all(&entries).await.map_err(CacheError::Writer)?;
            }
            if let Some(encoded) = encoded {
                if let Err(e) = self.put_chunks(&encoded, remote_ttl).await {
                    if let Some(local) = self.local() {
                        for (key, _) in &entries {
                            local.invalidate(key);
                        }
                    }
                    warn!(cache = %self.inner.name, error = %e, "Remote batch write failed, put_all rejected");
                    return Err(e);
                }
            }
            for (key, value) in &entries {
                self.store_local(key, Some(value.clone()), local_ttl);
            }
        }

        let keys = unique_keys(entries.into_iter().map(|(key, _)| key));
        self.record_puts(keys.len() as u64);
        self.publish(InvalidationMessage::bulk_evict(
            &self.inner.name,
            keys,
            &*self.inner.node_id,
        ))
        .await;
        self.record_latency("put_all", started);
        Ok(())
    }

    /// Remove a key from both tiers and tell peers to drop it.
    ///
    /// Returns whether a value existed. In write-through mode a remote
    /// failure is returned after the local copy has already been dropped.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let started = Instant::now();
        let write_behind = self.is_write_behind();

        if !write_behind {
            if let Some(writer) = &self.inner.writer {
                writer.delete(key).await.map_err(CacheError::Writer)?;
            }
        }

        let existed_locally = self.local().is_some_and(|local| {
            let existed = local.get(key).is_some_and(|entry| !entry.is_null());
            local.invalidate(key);
            existed
        });

        let existed = if write_behind {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move { this.remove_behind(vec![key]).await });
            existed_locally
        } else if let Some(remote) = self.remote() {
            let remote_key = self.remote_key(key);
            let existed_remotely = self.guarded_write(|| remote.delete(&remote_key)).await?;
            existed_remotely || existed_locally
        } else {
            existed_locally
        };

        self.record_removes(1);
        self.publish_evict(key).await;
        self.record_latency("remove", started);
        Ok(existed)
    }

    /// Remove many keys. Peers receive a single bulk eviction.
    pub async fn remove_all<I, K>(&self, keys: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = unique_keys(keys.into_iter().map(Into::into));
        if keys.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        if let Some(local) = self.local() {
            for key in &keys {
                local.invalidate(key);
            }
        }

        if self.is_write_behind() {
            let this = self.clone();
            let pending = keys.clone();
            tokio::spawn(async move { this.remove_behind(pending).await });
        } else {
            if let Some(writer) = &self.inner.writer {
                writer.delete_all(&keys).await.map_err(CacheError::Writer)?;
            }
            self.delete_chunks(&keys).await?;
        }

        self.record_removes(keys.len() as u64);
        self.publish(InvalidationMessage::bulk_evict(
            &self.inner.name,
            keys,
            &*self.inner.node_id,
        ))
        .await;
        self.record_latency("remove_all", started);
        Ok(())
    }

    /// Drop every entry of this cache from both tiers and from peers.
    ///
    /// Only keys under this cache's remote prefix are deleted.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let started = Instant::now();
        self.clear_local();

        if let Some(remote) = self.remote() {
            let prefix = self.remote_prefix();
            if self.is_write_behind() {
                let this = self.clone();
                tokio::spawn(async move {
                    let Some(remote) = this.remote() else {
                        return;
                    };
                    if let Err(e) = this.guarded_write(|| remote.clear_prefix(&prefix)).await {
                        warn!(cache = %this.inner.name, error = %e, "Write-behind clear failed");
                    }
                });
            } else {
                let removed = self.guarded_write(|| remote.clear_prefix(&prefix)).await?;
                info!(cache = %self.inner.name, removed, "Cleared remote entries");
            }
        }

        // One event for the whole clear.
        self.inner.stats.record_removes(1);
        self.inner.metrics.record_remove(&self.inner.name);
        self.inner
            .metrics
            .update_size(&self.inner.name, Tier::L1, 0);
        self.publish(InvalidationMessage::clear(
            &self.inner.name,
            &*self.inner.node_id,
        ))
        .await;
        self.record_latency("clear", started);
        Ok(())
    }

    async fn write_one(
        &self,
        key: &str,
        value: V,
        remote_ttl: Duration,
        local_ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = match self.remote() {
            Some(_) => Some(self.inner.codec.encode(&value)?),
            None => None,
        };

        if self.is_write_behind() {
            self.store_local(key, Some(value.clone()), local_ttl);
            let this = self.clone();
            let key_owned = key.to_string();
            tokio::spawn(async move { this.put_behind(key_owned, value, bytes, remote_ttl).await });
        } else {
            if let Some(writer) = &self.inner.writer {
                writer.write(key, &value).await.map_err(CacheError::Writer)?;
            }
            if let (Some(remote), Some(bytes)) = (self.remote(), bytes) {
                let remote_key = self.remote_key(key);
                let stored = self
                    .guarded_write(|| remote.put(&remote_key, bytes.clone(), remote_ttl))
                    .await;
                if let Err(e) = stored {
                    if let Some(local) = self.local() {
                        local.invalidate(key);
                    }
                    warn!(cache = %self.inner.name, key = %key, error = %e, "Remote write failed, put rejected");
                    return Err(e);
                }
            }
            self.store_local(key, Some(value), local_ttl);
        }

        self.record_puts(1);
        self.publish_evict(key).await;
        Ok(())
    }

    /// Take back an insert the writer rejected.
    async fn undo_insert(&self, key: &str) {
        if let Some(local) = self.local() {
            local.invalidate(key);
        }
        if let Some(remote) = self.remote() {
            let remote_key = self.remote_key(key);
            if let Err(e) = self.guarded_write(|| remote.delete(&remote_key)).await {
                warn!(cache = %self.inner.name, key = %key, error = %e, "Failed to roll back rejected insert");
            }
        }
    }

    async fn put_behind(&self, key: String, value: V, bytes: Option<Vec<u8>>, ttl: Duration) {
        if let Some(writer) = &self.inner.writer {
            if let Err(e) = writer.write(&key, &value).await {
                warn!(cache = %self.inner.name, key = %key, error = %e, "Write-behind writer failed");
            }
        }
        if let (Some(remote), Some(bytes)) = (self.remote(), bytes) {
            let remote_key = self.remote_key(&key);
            if let Err(e) = self
                .guarded_write(|| remote.put(&remote_key, bytes.clone(), ttl))
                .await
            {
                warn!(cache = %self.inner.name, key = %key, error = %e, "Write-behind remote write failed");
            }
        }
    }

    async fn put_all_behind(
        &self,
        entries: Vec<(String, V)>,
        encoded: Option<Vec<(String, Vec<u8>)>>,
        ttl: Duration,
    ) {
        if let Some(writer) = &self.inner.writer {
            if let Err(e) = writer.write_all(&entries).await {
                warn!(cache = %self.inner.name, error = %e, "Write-behind batch writer failed");
            }
        }
        if let Some(encoded) = encoded {
            if let Err(e) = self.put_chunks(&encoded, ttl).await {
                warn!(cache = %self.inner.name, error = %e, "Write-behind batch remote write failed");
            }
        }
    }

    async fn remove_behind(&self, keys: Vec<String>) {
        if let Some(writer) = &self.inner.writer {
            if let Err(e) = writer.delete_all(&keys).await {
                warn!(cache = %self.inner.name, error = %e, "Write-behind writer delete failed");
            }
        }
        if let Err(e) = self.delete_chunks(&keys).await {
            warn!(cache = %self.inner.name, error = %e, "Write-behind remote delete failed");
        }
    }

    async fn put_chunks(&self, encoded: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CacheError> {
        let Some(remote) = self.remote() else {
            return Ok(());
        };
        for chunk in encoded.chunks(self.batch_size()) {
            self.guarded_write(|| self.within_batch_timeout(remote.put_many(chunk.to_vec(), ttl)))
                .await?;
        }
        Ok(())
    }

    async fn delete_chunks(&self, keys: &[String]) -> Result<u64, CacheError> {
        let Some(remote) = self.remote() else {
            return Ok(0);
        };
        let mut deleted = 0;
        for chunk in keys.chunks(self.batch_size()) {
            let remote_keys: Vec<String> = chunk.iter().map(|key| self.remote_key(key)).collect();
            deleted += self
                .guarded_write(|| self.within_batch_timeout(remote.delete_many(&remote_keys)))
                .await?;
        }
        Ok(deleted)
    }

    async fn publish_evict(&self, key: &str) {
        self.publish(InvalidationMessage::evict(
            &self.inner.name,
            key,
            &*self.inner.node_id,
        ))
        .await;
    }
}

/// Deduplicate keys, keeping first-seen order.
fn unique_keys(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.filter(|key| seen.insert(key.clone())).collect()
}
