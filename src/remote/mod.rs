//! Remote (L2) tier.
//!
//! The remote tier is a shared, out-of-process byte store. It is the
//! source of cross-node truth: local tiers only ever hold copies of what
//! it (or a loader) produced.
//!
//! ## Implementations
//!
//! - [`RedisRemoteTier`] - Redis via a multiplexed connection manager
//! - [`InMemoryRemoteTier`] - shared in-process map, for tests and
//!   single-node deployments

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::InMemoryRemoteTier;
pub use self::redis::RedisRemoteTier;

/// Errors raised by a remote tier implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The store could not be reached or the call failed in transit.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call did not complete in time.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        RemoteError::Transport(message.into())
    }
}

/// Key/value client for the shared store.
///
/// Keys passed here are already fully qualified (prefix and cache name
/// included). A zero TTL is never passed; the coordinator turns it into a
/// delete.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetch one value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Fetch many values in a single round trip.
    ///
    /// The result has one slot per requested key, in request order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError>;

    /// Store one value.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RemoteError>;

    /// Store many values in a single round trip.
    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), RemoteError>;

    /// Store a value only if the key is absent.
    ///
    /// Returns `true` if the write took effect.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RemoteError>;

    /// Delete one key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    /// Delete many keys in a single round trip. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, RemoteError>;

    /// Delete every key starting with `prefix`. Returns how many existed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64, RemoteError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), RemoteError>;
}
