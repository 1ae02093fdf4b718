//! Cache module - two-level caching over Moka and a shared remote tier.
//!
//! ## Architecture
//!
//! - `CacheManager` - one per node; owns the remote tier, bus, metrics sink
//!   and circuit breaker, and hands out named coordinators
//! - `CacheCoordinator` - one logical cache spanning L1 and L2
//! - `LocalTier` - the in-process tier (`MokaLocalTier` by default)
//! - `CacheLoader` / `CacheWriter` - the system of record, seen from the cache
//!
//! ## Usage
//!
//! ```rust,ignore
//! let manager = CacheManager::builder()
//!     .remote(Arc::new(InMemoryRemoteTier::new()))
//!     .build();
//!
//! let users = manager.get_cache::<User>("users")?;
//! users.put("42", user).await?;
//! let user = users.get("42").await?;
//! ```

mod config;
mod coordinator;
mod flight;
mod loader;
mod local;
mod manager;
mod stats;

pub use config::{
    BatchConfig, CacheConfig, CompressionConfig, CompressionType, L1Config, L2Config,
    NullValueConfig, WriteMode,
};
pub use coordinator::{CacheCoordinator, CacheValue, CoordinatorBuilder};
pub use flight::{FlightGuard, SingleFlight};
pub use loader::{CacheLoader, CacheWriter, FnLoader};
pub use local::{CacheEntry, EvictionCallback, LocalTier, MokaLocalTier};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use stats::{CacheStats, CacheStatsSnapshot};
