//! Circuit breaker state machine.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ open duration elapsed
//!     │ successes >= max probes        ▼ (one caller wins the CAS)
//!     └──────────────────────────── HalfOpen
//!                 any failure ──────▶ Open
//! ```
//!
//! The state lives in a single `AtomicU8`; counters are separate atomics.
//! Every transition is a compare-and-swap from an expected state, so
//! concurrent callers converge on one transition without a lock. The
//! decision of what comes next is made by pure functions over the
//! current state and counters.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::ResilienceConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error from a call guarded by the breaker.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without running the call.
    #[error("circuit breaker is open")]
    Open,

    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Whether a caller may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allow,
    /// Try to move Open → HalfOpen and, if that wins, run as a probe.
    TryHalfOpen,
    Probe,
    Reject,
}

fn admission(
    state: CircuitState,
    open_elapsed: Duration,
    open_duration: Duration,
    probes_issued: u32,
    max_probes: u32,
) -> Admission {
    match state {
        CircuitState::Closed => Admission::Allow,
        CircuitState::Open if open_elapsed >= open_duration => Admission::TryHalfOpen,
        CircuitState::Open => Admission::Reject,
        CircuitState::HalfOpen if probes_issued < max_probes => Admission::Probe,
        CircuitState::HalfOpen => Admission::Reject,
    }
}

/// State after a failure, given the failure count including it.
fn after_failure(state: CircuitState, consecutive_failures: u32, threshold: u32) -> CircuitState {
    match state {
        CircuitState::Closed if consecutive_failures >= threshold => CircuitState::Open,
        CircuitState::HalfOpen => CircuitState::Open,
        other => other,
    }
}

/// State after a success, given the probe success count including it.
fn after_success(state: CircuitState, probe_successes: u32, success_threshold: u32) -> CircuitState {
    match state {
        CircuitState::HalfOpen if probe_successes >= success_threshold => CircuitState::Closed,
        other => other,
    }
}

/// Releases an unfinished probe slot when a cancelled call is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    finished: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .breaker
                .probes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}

/// Breaker protecting one resource.
pub struct CircuitBreaker {
    name: String,
    config: ResilienceConfig,
    state: AtomicU8,
    failures: AtomicU32,
    probes: AtomicU32,
    successes: AtomicU32,
    /// Milliseconds since `epoch` at the last trip.
    opened_at: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Check if calls are currently rejected outright.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn open_elapsed(&self) -> Duration {
        let opened = self.opened_at.load(Ordering::Acquire);
        Duration::from_millis(self.now_millis().saturating_sub(opened))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Decide whether a call may run. Returns `Some(is_probe)` if admitted.
    fn acquire(&self) -> Option<bool> {
        let state = self.state();
        let decision = admission(
            state,
            self.open_elapsed(),
            self.config.open_state_duration,
            self.probes.load(Ordering::Acquire),
            self.config.half_open_max_calls,
        );

        match decision {
            Admission::Allow => Some(false),
            Admission::Reject => None,
            Admission::TryHalfOpen => {
                // Losers keep seeing Open until the probes settle.
                if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    self.probes.fetch_add(1, Ordering::AcqRel);
                    info!(breaker = %self.name, "Circuit breaker half-open, probing");
                    Some(true)
                } else {
                    None
                }
            }
            Admission::Probe => {
                let issued = self.probes.fetch_add(1, Ordering::AcqRel);
                if issued < self.config.half_open_max_calls {
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    fn trip(&self, from: CircuitState) {
        // Stamp before the state flips so admission never sees Open with a
        // stale timestamp. A losing trip puts the previous stamp back.
        let now = self.now_millis();
        let previous = self.opened_at.swap(now, Ordering::AcqRel);
        if !self.transition(from, CircuitState::Open) {
            let _ = self.opened_at.compare_exchange(
                now,
                previous,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }
        self.failures.store(0, Ordering::Release);
        self.probes.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        warn!(
            breaker = %self.name,
            from = %from,
            open_for_ms = self.config.open_state_duration.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                let _ = self
                    .failures
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            }
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                let next = after_success(
                    CircuitState::HalfOpen,
                    successes,
                    self.config.half_open_max_calls,
                );
                if next == CircuitState::Closed
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.failures.store(0, Ordering::Release);
                    self.probes.store(0, Ordering::Release);
                    self.successes.store(0, Ordering::Release);
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let state = self.state();
        let failures = match state {
            CircuitState::Closed => self.failures.fetch_add(1, Ordering::AcqRel) + 1,
            _ => self.failures.load(Ordering::Acquire),
        };

        debug!(breaker = %self.name, state = %state, failures, "Guarded call failed");

        if after_failure(state, failures, self.config.failure_threshold) == CircuitState::Open
            && state != CircuitState::Open
        {
            self.trip(state);
        }
    }

    /// Run `op` if the breaker admits it, recording the outcome.
    ///
    /// Rejected calls never invoke `op`. Dropping the returned future
    /// mid-call records nothing and frees any probe slot it held.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(is_probe) = self.acquire() else {
            debug!(breaker = %self.name, "Call rejected by open circuit breaker");
            return Err(BreakerError::Open);
        };

        let mut slot = ProbeSlot {
            breaker: self,
            finished: !is_probe,
        };

        let result = op().await;
        slot.finished = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Like [`execute`](Self::execute), substituting `fallback` when the
    /// call is rejected or fails.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(&self, op: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> T,
    {
        match self.execute(op).await {
            Ok(value) => value,
            Err(e) => fallback(e),
        }
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.probes.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.consecutive_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn breaker(threshold: u32, open_for: Duration, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            ResilienceConfig::default()
                .failure_threshold(threshold)
                .open_state_duration(open_for)
                .half_open_max_calls(probes),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("down") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[test]
    fn test_pure_transitions() {
        let secs = Duration::from_secs;
        assert_eq!(admission(CircuitState::Closed, secs(0), secs(1), 0, 1), Admission::Allow);
        assert_eq!(admission(CircuitState::Open, secs(0), secs(1), 0, 1), Admission::Reject);
        assert_eq!(
            admission(CircuitState::Open, secs(1), secs(1), 0, 1),
            Admission::TryHalfOpen
        );
        assert_eq!(admission(CircuitState::HalfOpen, secs(0), secs(1), 1, 2), Admission::Probe);
        assert_eq!(admission(CircuitState::HalfOpen, secs(0), secs(1), 2, 2), Admission::Reject);

        assert_eq!(after_failure(CircuitState::Closed, 2, 3), CircuitState::Closed);
        assert_eq!(after_failure(CircuitState::Closed, 3, 3), CircuitState::Open);
        assert_eq!(after_failure(CircuitState::HalfOpen, 0, 3), CircuitState::Open);

        assert_eq!(after_success(CircuitState::HalfOpen, 1, 2), CircuitState::HalfOpen);
        assert_eq!(after_success(CircuitState::HalfOpen, 2, 2), CircuitState::Closed);
        assert_eq!(after_success(CircuitState::Closed, 9, 2), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trips_after_threshold_and_rejects_without_calling() {
        let breaker = breaker(3, Duration::from_secs(60), 1);
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("down"))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_decrements_failures() {
        let breaker = breaker(3, Duration::from_secs(60), 1);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.consecutive_failures(), 1);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        succeed(&breaker).await.unwrap_err();
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_recovers_after_probe_successes() {
        let breaker = breaker(1, Duration::from_millis(30), 2);
        fail(&breaker).await.unwrap_err();
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(50)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(30), 3);
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_probes() {
        let breaker = Arc::new(breaker(1, Duration::from_millis(20), 1));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = wait.await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        release.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_frees_its_slot() {
        let breaker = breaker(1, Duration::from_millis(20), 1);
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let pending = breaker.execute(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_losing_trip_keeps_open_window() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        fail(&breaker).await.unwrap_err();
        let opened = breaker.opened_at.load(Ordering::Acquire);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Already open, so this trip loses the transition.
        breaker.trip(CircuitState::Closed);

        assert!(breaker.is_open());
        assert_eq!(breaker.opened_at.load(Ordering::Acquire), opened);
    }

    #[tokio::test]
    async fn test_fallback() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        let value = breaker
            .execute_with_fallback(|| async { Err::<u32, _>("down") }, |_| 7)
            .await;
        assert_eq!(value, 7);

        let value = breaker
            .execute_with_fallback(
                || async { Ok::<u32, &'static str>(1) },
                |e| match e {
                    BreakerError::Open => 42,
                    BreakerError::Inner(_) => 0,
                },
            )
            .await;
        assert_eq!(value, 42);
    }
}
