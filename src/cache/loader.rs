//! Loader and writer collaborators.
//!
//! A [`CacheLoader`] produces values on a total miss; a [`CacheWriter`]
//! mirrors mutations to the system of record.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::debug;

use crate::error::BoxError;

/// Source of values for keys missing from every tier.
#[async_trait]
pub trait CacheLoader<V>: Send + Sync
where
    V: Send + 'static,
{
    /// Load one value. `Ok(None)` means the key does not exist.
    async fn load(&self, key: &str) -> Result<Option<V>, BoxError>;

    /// Load many values. Keys that fail or do not exist are omitted.
    async fn load_all(&self, keys: &[String]) -> HashMap<String, V> {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.load(key).await {
                Ok(Some(value)) => {
                    loaded.insert(key.clone(), value);
                }
                Ok(None) => {}
                Err(e) => debug!(key = %key, error = %e, "Batch load skipped key"),
            }
        }
        loaded
    }
}

/// Mirrors cache mutations to the system of record.
#[async_trait]
pub trait CacheWriter<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    async fn write(&self, key: &str, value: &V) -> Result<(), BoxError>;

    async fn write_all(&self, entries: &[(String, V)]) -> Result<(), BoxError> {
        for (key, value) in entries {
            self.write(key, value).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError>;

    async fn delete_all(&self, keys: &[String]) -> Result<(), BoxError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Loader built from an async closure.
///
/// ```rust,ignore
/// let loader = FnLoader::new(|key: String| async move {
///     Ok(db.find_order(&key).await?)
/// });
/// ```
pub struct FnLoader<F, V> {
    f: F,
    _value: PhantomData<fn() -> V>,
}

impl<F, V> FnLoader<F, V> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, V> CacheLoader<V> for FnLoader<F, V>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<V>, BoxError>> + Send,
    V: Send + 'static,
{
    async fn load(&self, key: &str) -> Result<Option<V>, BoxError> {
        (self.f)(key.to_string()).await
    }
}
