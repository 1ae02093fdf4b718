//! Cross-node cache invalidation.
//!
//! After a mutation, a coordinator publishes an [`InvalidationMessage`]
//! telling peers their local copy of some keys is stale. Peers evict
//! their local tier only; the remote tier already holds the truth.
//!
//! ## Delivery
//!
//! - At-least-once, unordered across cache names
//! - Listeners run on the bus's own delivery task, never on the
//!   publisher's task
//! - Handling a duplicate or stale evict is a no-op
//!
//! ```text
//! Node A: put("k") → remote SET → local insert → PUBLISH {evict, "k"}
//!                                                   ↓
//! Node B: listener receives {evict, "k"} → local invalidate("k")
//! Node A: listener receives its own message → ignored (originId)
//! ```

mod memory;
mod message;
mod redis;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

pub use memory::{MemoryBroker, MemoryBus};
pub use message::{InvalidationKeys, InvalidationKind, InvalidationMessage};
pub use self::redis::{DEFAULT_CHANNEL, RedisBus};

/// Errors raised by a bus implementation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus transport failure: {0}")]
    Transport(String),

    #[error("failed to encode invalidation message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bus is not running")]
    NotRunning,
}

/// Receives invalidation messages.
pub trait InvalidationListener: Send + Sync {
    fn on_message(&self, message: &InvalidationMessage);
}

/// Handle returned by [`InvalidationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe channel between cooperating nodes.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish a message to every node, including this one.
    ///
    /// Returns once the message is handed to the transport; never waits
    /// for subscribers to process it.
    async fn publish(&self, message: InvalidationMessage) -> Result<(), BusError>;

    /// Register a listener for delivered messages.
    fn subscribe(&self, listener: Arc<dyn InvalidationListener>) -> SubscriptionId;

    /// Remove a listener. Returns `true` if it was registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Start the delivery task. Starting a running bus is a no-op.
    async fn start(&self) -> Result<(), BusError>;

    /// Stop the delivery task and wait for it to exit.
    async fn stop(&self);
}

/// Listener list shared by bus implementations.
#[derive(Default)]
pub struct Listeners {
    entries: RwLock<Vec<(SubscriptionId, Arc<dyn InvalidationListener>)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn InvalidationListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deliver a message to every listener.
    ///
    /// The list is copied first so listeners may (un)subscribe while
    /// handling a message.
    pub fn dispatch(&self, message: &InvalidationMessage) {
        let listeners: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        debug!(
            cache = %message.cache_name,
            kind = ?message.kind,
            listeners = listeners.len(),
            "Dispatching invalidation"
        );

        for listener in listeners {
            listener.on_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InvalidationMessage>>,
    }

    impl InvalidationListener for Recorder {
        fn on_message(&self, message: &InvalidationMessage) {
            self.seen.lock().push(message.clone());
        }
    }

    #[test]
    fn test_subscribe_dispatch_unsubscribe() {
        let listeners = Listeners::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let first_id = listeners.add(first.clone());
        listeners.add(second.clone());
        assert_eq!(listeners.len(), 2);

        listeners.dispatch(&InvalidationMessage::evict("orders", "o1", "node-a"));
        assert!(listeners.remove(first_id));
        assert!(!listeners.remove(first_id));
        listeners.dispatch(&InvalidationMessage::clear("orders", "node-a"));

        assert_eq!(first.seen.lock().len(), 1);
        assert_eq!(second.seen.lock().len(), 2);
    }
}
