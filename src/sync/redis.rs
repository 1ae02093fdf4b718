//! Redis pub/sub invalidation bus.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BusError, InvalidationBus, InvalidationListener, InvalidationMessage, Listeners,
    SubscriptionId,
};

/// Channel used when none is configured.
pub const DEFAULT_CHANNEL: &str = "cache:invalidate";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reconnect delay, doubling up to `MAX_BACKOFF`.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    /// Delay to wait now; the next call waits twice as long.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

/// Invalidation bus over a Redis pub/sub channel.
///
/// Publishing goes through a shared connection manager. Delivery uses a
/// dedicated pub/sub connection owned by a background task that
/// resubscribes with exponential backoff whenever the connection drops.
///
/// ```text
/// Node A: PUBLISH cache:invalidate {"cacheName":"orders","keys":"o1",...}
///   ↓
/// Node B: delivery task decodes → listeners → local evict
/// ```
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
    channel: String,
    listeners: Arc<Listeners>,
    worker: Mutex<Option<Worker>>,
}

impl RedisBus {
    /// Connect to Redis at `url`, using `channel` for invalidations.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::Transport(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            conn,
            channel: channel.into(),
            listeners: Arc::new(Listeners::new()),
            worker: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Subscribe once and deliver until the connection closes or the token
/// is cancelled. `Ok(())` means cancelled. A successful subscription
/// resets `backoff`.
async fn listen(
    client: &Client,
    channel: &str,
    listeners: &Listeners,
    token: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<(), String> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| format!("failed to subscribe: {e}"))?;

    info!(channel = %channel, "Subscribed to invalidation channel");
    backoff.reset();

    let mut stream = std::pin::pin!(pubsub.on_message());
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = stream.next() => msg,
        };

        let Some(msg) = msg else {
            return Err("pub/sub connection closed".to_string());
        };

        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to read invalidation payload");
                continue;
            }
        };

        match InvalidationMessage::from_json(&payload) {
            Ok(message) => listeners.dispatch(&message),
            Err(e) => warn!(error = %e, "Failed to decode invalidation message"),
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, message: InvalidationMessage) -> Result<(), BusError> {
        let payload = message.to_json()?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| BusError::Transport(format!("failed to publish invalidation: {e}")))?;

        debug!(cache = %message.cache_name, kind = ?message.kind, "Published invalidation");
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

        let client = self.client.clone();
        let channel = self.channel.clone();
        let listeners = Arc::clone(&self.listeners);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::new();

            loop {
                match listen(&client, &channel, &listeners, &cancelled, &mut backoff).await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!(
                            error = %e,
                            backoff_secs = delay.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                        tokio::select! {
                            _ = cancelled.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            debug!("Redis invalidation listener stopped");
        });

        *worker = Some(Worker { token, handle });
        Ok(())
    }

    async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Invalidation listener ended abnormally");
            }
            info!(channel = %self.channel, "Redis invalidation bus stopped");
        }
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_BACKOFF);

        // After a successful resubscribe the next outage starts over.
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }
}
