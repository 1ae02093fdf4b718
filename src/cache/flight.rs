//! Per-key single-flight guard against cache stampedes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes loads of the same key.
///
/// The first caller for a key gets the lock immediately; later callers
/// wait for it and should re-check the cache before loading themselves.
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`.
    ///
    /// The guard exists before the wait starts, so a caller cancelled
    /// while queued still cleans up the entry.
    pub async fn acquire(&self, key: &str) -> FlightGuard<'_> {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let mut flight = FlightGuard {
            map: &self.in_flight,
            key: key.to_string(),
            guard: None,
        };
        flight.guard = Some(lock.lock_owned().await);
        flight
    }

    /// Keys currently loading or waited on.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Releases the key on drop, removing its entry once nobody waits on it.
/// Runs on early return and on cancellation alike.
pub struct FlightGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone; only the map's own reference means idle.
        self.map
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let flight = Arc::new(SingleFlight::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            tasks.push(tokio::spawn(async move {
                let _guard = flight.acquire("k").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let flight = SingleFlight::new();
        let _a = flight.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), flight.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_removes_entry() {
        let flight = SingleFlight::new();
        let first = flight.acquire("k").await;

        let mut waiter = Box::pin(flight.acquire("k"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        // The holder leaves while the waiter still references the entry.
        drop(first);
        assert_eq!(flight.in_flight(), 1);

        drop(waiter);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_entry_kept_while_waited_on() {
        let flight = Arc::new(SingleFlight::new());
        let first = flight.acquire("k").await;

        let waiter = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                let _guard = flight.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        assert_eq!(flight.in_flight(), 1);
        waiter.await.unwrap();
        assert_eq!(flight.in_flight(), 0);
    }
}
