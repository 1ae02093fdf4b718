//! Crate-wide error type.
//!
//! Tier-internal failures (`RemoteError`, `BusError`) never reach callers
//! as-is: the coordinator folds them into [`CacheError`].

use crate::remote::RemoteError;
use crate::serialization::SerializationError;

/// Boxed error used for user-supplied collaborators (loaders, writers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The remote tier could not be reached or failed the call.
    #[error("remote tier unavailable: {0}")]
    RemoteUnavailable(#[source] RemoteError),

    /// The circuit breaker guarding the remote tier is open.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The configured loader failed for a key.
    #[error("loader failed for key '{key}': {source}")]
    LoadFailure {
        key: String,
        #[source]
        source: BoxError,
    },

    /// A value could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The configured cache writer rejected the operation.
    #[error("cache writer failed: {0}")]
    Writer(#[source] BoxError),

    /// A cache name is already registered with another value type.
    #[error("cache '{name}' is registered with value type {registered}, requested {requested}")]
    TypeMismatch {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// The owning manager has been shut down.
    #[error("cache manager has been shut down")]
    ShutDown,
}

impl CacheError {
    /// Whether retrying the same remote call could succeed.
    ///
    /// An open breaker is not retryable: it rejects until its cooldown ends.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::RemoteUnavailable(_))
    }

    /// Whether this error means the remote tier could not serve the call,
    /// either because it failed or because the breaker refused it.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::RemoteUnavailable(_) | CacheError::CircuitOpen(_)
        )
    }
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        CacheError::RemoteUnavailable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let transport = CacheError::from(RemoteError::transport("connection reset"));
        assert!(transport.is_retryable());
        assert!(transport.is_remote_unavailable());

        let open = CacheError::CircuitOpen("remote".into());
        assert!(!open.is_retryable());
        assert!(open.is_remote_unavailable());

        let load = CacheError::LoadFailure {
            key: "k".into(),
            source: "boom".into(),
        };
        assert!(!load.is_retryable());
        assert!(!load.is_remote_unavailable());
    }

    #[test]
    fn test_messages() {
        let err = CacheError::CircuitOpen("orders".into());
        assert_eq!(err.to_string(), "circuit breaker 'orders' is open");
    }
}
