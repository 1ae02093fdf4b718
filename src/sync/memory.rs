//! In-process invalidation bus.
//!
//! A [`MemoryBroker`] plays the role of the pub/sub server; each node
//! gets its own [`MemoryBus`] from it. Used for tests and for several
//! managers sharing one process.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BusError, InvalidationBus, InvalidationListener, InvalidationMessage, Listeners,
    SubscriptionId,
};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out point shared by every [`MemoryBus`] created from it.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker buffering up to `capacity` undelivered messages
    /// per bus; slower buses skip the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a bus attached to this broker.
    pub fn bus(&self) -> MemoryBus {
        MemoryBus {
            sender: self.sender.clone(),
            listeners: Arc::new(Listeners::new()),
            worker: Mutex::new(None),
        }
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One node's connection to a [`MemoryBroker`].
pub struct MemoryBus {
    sender: broadcast::Sender<InvalidationMessage>,
    listeners: Arc<Listeners>,
    worker: Mutex<Option<Worker>>,
}

impl MemoryBus {
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, message: InvalidationMessage) -> Result<(), BusError> {
        // No receiver just means no node has started yet.
        if self.sender.send(message).is_err() {
            debug!("Published invalidation with no running subscribers");
        }
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn InvalidationListener>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let mut receiver = self.sender.subscribe();
        let listeners = Arc::clone(&self.listeners);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => listeners.dispatch(&message),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Invalidation bus lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("In-memory invalidation bus stopped");
        });

        *worker = Some(Worker { token, handle });
        info!("In-memory invalidation bus started");
        Ok(())
    }

    async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Invalidation delivery task ended abnormally");
            }
        }
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.token.cancel();
        }
    }
}
