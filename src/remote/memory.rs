//! In-process remote tier.
//!
//! Clones share the same store, so several coordinators (or several
//! managers standing in for separate nodes) can point at one instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use super::{RemoteError, RemoteTier};

struct StoredValue {
    data: Vec<u8>,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    round_trips: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// Shared in-memory byte store with TTLs.
///
/// Supports fault injection (`set_available(false)`), artificial latency
/// and round-trip counting so callers can be tested against outages.
#[derive(Clone, Default)]
pub struct InMemoryRemoteTier {
    inner: Arc<Inner>,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Number of calls served (or refused) so far.
    pub fn round_trips(&self) -> usize {
        self.inner.round_trips.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count()
    }

    /// Check if the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a live entry exists, without counting a round trip.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    async fn round_trip(&self) -> Result<(), RemoteError> {
        self.inner.round_trips.fetch_add(1, Ordering::SeqCst);

        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("in-memory remote tier is unavailable"));
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.inner.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.inner
                .entries
                .remove_if(key, |_, value| value.is_expired());
            return None;
        }
        Some(entry.data.clone())
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.round_trip().await?;
        Ok(self.read(key))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError> {
        self.round_trip().await?;
        Ok(keys.iter().map(|key| self.read(key)).collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RemoteError> {
        self.round_trip().await?;
        self.inner
            .entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        self.round_trip().await?;
        for (key, value) in entries {
            self.inner.entries.insert(key, StoredValue::new(value, ttl));
        }
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        self.round_trip().await?;
        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        self.round_trip().await?;
        Ok(self
            .inner
            .entries
            .remove(key)
            .is_some_and(|(_, value)| !value.is_expired()))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, RemoteError> {
        self.round_trip().await?;
        let removed = keys
            .iter()
            .filter_map(|key| self.inner.entries.remove(key))
            .filter(|(_, value)| !value.is_expired())
            .count();
        Ok(removed as u64)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        self.round_trip().await?;
        let mut removed = 0u64;
        self.inner.entries.retain(|key, value| {
            if key.starts_with(prefix) {
                if !value.is_expired() {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.round_trip().await
    }
}

impl std::fmt::Debug for InMemoryRemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRemoteTier")
            .field("entries", &self.inner.entries.len())
            .field("available", &!self.inner.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let remote = InMemoryRemoteTier::new();
        remote.put("a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(remote.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(remote.delete("a").await.unwrap());
        assert!(!remote.delete("a").await.unwrap());
        assert_eq!(remote.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let remote = InMemoryRemoteTier::new();
        remote.put("a", b"1".to_vec(), Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(remote.get("a").await.unwrap(), None);
        // Expired keys count as absent for put-if-absent.
        assert!(remote.put_if_absent("a", b"2".to_vec(), Duration::from_secs(60)).await.unwrap());
        assert!(!remote.put_if_absent("a", b"3".to_vec(), Duration::from_secs(60)).await.unwrap());
        assert_eq!(remote.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let remote = InMemoryRemoteTier::new();
        remote.put("a", b"1".to_vec(), Duration::MAX).await.unwrap();
        remote
            .put_many(vec![("b".into(), b"2".to_vec())], Duration::MAX)
            .await
            .unwrap();
        assert!(!remote.put_if_absent("a", b"3".to_vec(), Duration::MAX).await.unwrap());

        assert_eq!(remote.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(remote.contains("b"));
    }

    #[tokio::test]
    async fn test_batch_calls_are_single_round_trips() {
        let remote = InMemoryRemoteTier::new();
        remote
            .put_many(
                vec![("a".into(), b"1".to_vec()), ("c".into(), b"3".to_vec())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let before = remote.round_trips();
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = remote.get_many(&keys).await.unwrap();
        assert_eq!(remote.round_trips(), before + 1);
        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);

        assert_eq!(remote.delete_many(&keys).await.unwrap(), 2);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_clear_prefix() {
        let remote = InMemoryRemoteTier::new();
        let ttl = Duration::from_secs(60);
        remote.put("cache:orders:1", vec![1], ttl).await.unwrap();
        remote.put("cache:orders:2", vec![2], ttl).await.unwrap();
        remote.put("cache:users:1", vec![3], ttl).await.unwrap();

        assert_eq!(remote.clear_prefix("cache:orders:").await.unwrap(), 2);
        assert_eq!(remote.len(), 1);
        assert!(remote.contains("cache:users:1"));
    }

    #[tokio::test]
    async fn test_outage() {
        let remote = InMemoryRemoteTier::new();
        remote.set_available(false);
        assert!(matches!(remote.get("a").await, Err(RemoteError::Transport(_))));
        assert!(remote.ping().await.is_err());

        remote.set_available(true);
        assert!(remote.ping().await.is_ok());
        assert_eq!(remote.round_trips(), 3);
    }
}
