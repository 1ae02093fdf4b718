//! Tiercache - two-level caching for clustered services.
//!
//! An in-process tier (L1) in front of a shared remote tier (L2), kept
//! coherent across nodes by an invalidation bus.
//!
//! ## Architecture
//!
//! - `cache` - coordinators, the local tier and the per-node manager
//! - `remote` - the shared byte store (Redis or in-memory)
//! - `sync` - cross-node invalidation messages and buses
//! - `resilience` - circuit breaker and retry around the remote tier
//! - `metrics` - hit/miss/load recording, in-memory and `metrics` facade
//! - `serialization` - value encoding, compression and null framing
//! - `config` - environment configuration
//! - `utils` - parsing helpers

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod remote;
pub mod resilience;
pub mod serialization;
pub mod sync;
pub mod utils;

pub use cache::{CacheConfig, CacheCoordinator, CacheManager};
pub use error::{BoxError, CacheError};
