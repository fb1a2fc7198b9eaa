//! Request Deduplicator Module
//!
//! Collapses concurrent identical requests into a single execution.
//!
//! The first caller for a key spawns the operation on its own task and
//! registers an in-flight entry; later callers for the same key subscribe to
//! that entry's result channel instead of running the operation again. A
//! successful result is kept for a short echo window so near-simultaneous
//! repeats reuse it. Failures are fanned out to every waiter but never echoed.
//!
//! A caller that goes away only drops its subscription. The execution is
//! aborted once nobody is left waiting for it.

mod stats;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::OptimizeError;

pub use stats::DedupStats;

/// How long a settled success is replayed to late arrivals.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(30);
/// How long an execution may stay in flight before waiters give up.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30);

type Outcome<T> = Result<T, OptimizeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub echo_window: Duration,
    pub max_lifetime: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            echo_window: DEFAULT_ECHO_WINDOW,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }
}

/// How a caller obtained its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupRole {
    /// Started the execution
    Leader,
    /// Waited on someone else's execution
    Joined,
    /// Reused a result settled within the echo window
    Echoed,
}

impl DedupRole {
    pub fn is_deduplicated(self) -> bool {
        !matches!(self, DedupRole::Leader)
    }
}

/// A successful deduplicated result.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced<T> {
    pub value: T,
    pub role: DedupRole,
}

/// What an operation hands back to the deduplicator.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<T> {
    pub value: T,
    /// Whether late arrivals may reuse the value within the echo window
    pub replayable: bool,
}

impl<T> Settled<T> {
    pub fn replayable(value: T) -> Self {
        Self { value, replayable: true }
    }

    /// A value shared with current waiters only.
    pub fn once(value: T) -> Self {
        Self { value, replayable: false }
    }
}

// == Registry ==
struct InFlightEntry<T> {
    /// Distinguishes this execution from a later one under the same key
    id: u64,
    started_at: Instant,
    subscribers: usize,
    result: watch::Receiver<Option<Outcome<T>>>,
    abort: AbortHandle,
}

struct EchoEntry<T> {
    value: T,
    expires_at: Instant,
}

struct Registry<T> {
    in_flight: HashMap<String, InFlightEntry<T>>,
    echoes: HashMap<String, EchoEntry<T>>,
    stats: DedupStats,
    next_id: u64,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            echoes: HashMap::new(),
            stats: DedupStats::new(),
            next_id: 0,
        }
    }

    fn refresh_gauges(&mut self) {
        self.stats.concurrent_requests = self.in_flight.len();
        self.stats.echo_entries = self.echoes.len();
    }
}

impl<T: Clone> Registry<T> {
    fn fresh_echo(&mut self, key: &str) -> Option<T> {
        let echo = self.echoes.get(key)?;
        if Instant::now() < echo.expires_at {
            return Some(echo.value.clone());
        }
        self.echoes.remove(key);
        None
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// == Subscription ==
/// One caller's interest in an in-flight execution.
struct Subscription<T> {
    registry: Arc<Mutex<Registry<T>>>,
    key: String,
    id: u64,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut guard = lock(&self.registry);
        let registry = &mut *guard;

        // Already settled, or replaced by a newer execution.
        let Some(entry) = registry.in_flight.get_mut(&self.key) else {
            return;
        };
        if entry.id != self.id {
            return;
        }

        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }

        entry.abort.abort();
        registry.in_flight.remove(&self.key);
        registry.stats.cancelled += 1;
        registry.refresh_gauges();
        debug!(key = %self.key, "Every caller detached; execution cancelled");
    }
}

// == Request Deduplicator ==
/// Per-key registry of in-flight executions.
///
/// Cheap to clone; clones share the registry.
pub struct RequestDeduplicator<T> {
    registry: Arc<Mutex<Registry<T>>>,
    config: DedupConfig,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            config: self.config,
        }
    }
}

impl<T> fmt::Debug for RequestDeduplicator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DedupConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            config,
        }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    // == Execute Or Join ==
    /// Runs `operation` for `key`, or joins the execution already in flight.
    ///
    /// Every caller attached to one execution receives the same value or the
    /// same error. `operation` is only invoked when this call starts a new
    /// execution.
    pub async fn execute_or_join<F, Fut>(&self, key: &str, operation: F) -> Result<Coalesced<T>, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.execute_or_join_within(key, self.config.echo_window, operation)
            .await
    }

    /// Like [`RequestDeduplicator::execute_or_join`], but a success started by
    /// this call is replayed for at most `echo_window` (capped by the
    /// configured window).
    pub async fn execute_or_join_within<F, Fut>(
        &self,
        key: &str,
        echo_window: Duration,
        operation: F,
    ) -> Result<Coalesced<T>, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.execute_or_join_settled(key, echo_window, move || async move {
            operation().await.map(Settled::replayable)
        })
        .await
    }

    /// Like [`RequestDeduplicator::execute_or_join_within`], with the
    /// operation deciding whether its success may be replayed.
    pub async fn execute_or_join_settled<F, Fut>(
        &self,
        key: &str,
        echo_window: Duration,
        operation: F,
    ) -> Result<Coalesced<T>, OptimizeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Settled<T>>> + Send + 'static,
    {
        let started = Instant::now();
        let echo_window = echo_window.min(self.config.echo_window);

        let (mut result, subscription, role) = {
            let mut guard = lock(&self.registry);
            let registry = &mut *guard;
            registry.stats.total_requests += 1;

            if let Some(entry) = registry.in_flight.get_mut(key) {
                entry.subscribers += 1;
                let subscription = Subscription {
                    registry: self.registry.clone(),
                    key: key.to_string(),
                    id: entry.id,
                };
                let result = entry.result.clone();
                registry.stats.deduplicated_requests += 1;
                debug!(key = %key, subscribers = entry.subscribers, "Joined in-flight execution");
                (result, subscription, DedupRole::Joined)
            } else {
                if let Some(value) = registry.fresh_echo(key) {
                    registry.stats.deduplicated_requests += 1;
                    registry.refresh_gauges();
                    debug!(key = %key, "Replaying settled result");
                    return Ok(Coalesced {
                        value,
                        role: DedupRole::Echoed,
                    });
                }

                let id = registry.next_id;
                registry.next_id += 1;

                let (tx, rx) = watch::channel(None);
                let handle = tokio::spawn(run_shared(
                    self.registry.clone(),
                    key.to_string(),
                    id,
                    Lifetimes {
                        echo_window,
                        max_lifetime: self.config.max_lifetime,
                    },
                    tx,
                    operation,
                ));

                registry.in_flight.insert(
                    key.to_string(),
                    InFlightEntry {
                        id,
                        started_at: started,
                        subscribers: 1,
                        result: rx.clone(),
                        abort: handle.abort_handle(),
                    },
                );
                registry.refresh_gauges();

                let subscription = Subscription {
                    registry: self.registry.clone(),
                    key: key.to_string(),
                    id,
                };
                (rx, subscription, DedupRole::Leader)
            }
        };

        let settled = match result.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };
        drop(subscription);

        if role == DedupRole::Joined {
            let waited_ms = started.elapsed().as_secs_f64() * 1000.0;
            lock(&self.registry).stats.record_wait(waited_ms);
        }

        let outcome = settled.unwrap_or_else(|| {
            Err(OptimizeError::operation(anyhow!(
                "Execution for '{}' ended without a result",
                key
            )))
        });
        outcome.map(|value| Coalesced { value, role })
    }

    // == Maintenance ==
    /// Drops echoes past their window. Returns how many were dropped.
    pub fn purge_expired_echoes(&self) -> usize {
        let mut registry = lock(&self.registry);
        let now = Instant::now();
        let before = registry.echoes.len();
        registry.echoes.retain(|_, echo| now < echo.expires_at);
        let purged = before - registry.echoes.len();
        registry.refresh_gauges();
        purged
    }

    /// Drops the echoes of `keys` so their next call executes again.
    pub fn forget<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = lock(&self.registry);
        for key in keys {
            registry.echoes.remove(key.as_ref());
        }
        registry.refresh_gauges();
    }

    /// Drops every echo. In-flight executions keep running for their waiters.
    pub fn clear(&self) -> usize {
        let mut registry = lock(&self.registry);
        let count = registry.echoes.len();
        registry.echoes.clear();
        registry.refresh_gauges();
        count
    }

    pub fn stats(&self) -> DedupStats {
        lock(&self.registry).stats.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.registry).in_flight.len()
    }

    /// Callers currently waiting on `key`'s execution.
    pub fn subscribers(&self, key: &str) -> Option<usize> {
        lock(&self.registry)
            .in_flight
            .get(key)
            .map(|entry| entry.subscribers)
    }

    /// Age of the oldest in-flight execution.
    pub fn oldest_in_flight(&self) -> Option<Duration> {
        lock(&self.registry)
            .in_flight
            .values()
            .map(|entry| entry.started_at.elapsed())
            .max()
    }
}

// == Shared Execution ==
#[derive(Debug, Clone, Copy)]
struct Lifetimes {
    echo_window: Duration,
    max_lifetime: Duration,
}

async fn run_shared<T, F, Fut>(
    registry: Arc<Mutex<Registry<T>>>,
    key: String,
    id: u64,
    lifetimes: Lifetimes,
    tx: watch::Sender<Option<Outcome<T>>>,
    operation: F,
) where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Settled<T>>> + Send + 'static,
{
    let execution = AssertUnwindSafe(async move { operation().await }).catch_unwind();

    let (outcome, replayable) = match tokio::time::timeout(lifetimes.max_lifetime, execution).await {
        Ok(Ok(Ok(settled))) => (Ok(settled.value), settled.replayable),
        Ok(Ok(Err(e))) => (Err(OptimizeError::operation(e)), false),
        Ok(Err(_panic)) => (
            Err(OptimizeError::operation(anyhow!("Execution for '{}' panicked", key))),
            false,
        ),
        Err(_elapsed) => (
            Err(OptimizeError::DeduplicationTimeout {
                key: key.clone(),
                timeout_ms: lifetimes.max_lifetime.as_millis() as u64,
            }),
            false,
        ),
    };

    let echo_window = if replayable {
        lifetimes.echo_window
    } else {
        Duration::ZERO
    };
    settle(&registry, &key, id, echo_window, &outcome);
    tx.send_replace(Some(outcome));
}

/// Retires the in-flight entry and records the outcome.
fn settle<T: Clone>(
    registry: &Mutex<Registry<T>>,
    key: &str,
    id: u64,
    echo_window: Duration,
    outcome: &Outcome<T>,
) {
    let mut guard = lock(registry);
    let registry = &mut *guard;

    if registry.in_flight.get(key).is_some_and(|entry| entry.id == id) {
        registry.in_flight.remove(key);
    }

    match outcome {
        Ok(_) if echo_window.is_zero() => {
            registry.echoes.remove(key);
        }
        Ok(value) => {
            registry.echoes.insert(
                key.to_string(),
                EchoEntry {
                    value: value.clone(),
                    expires_at: Instant::now() + echo_window,
                },
            );
        }
        Err(OptimizeError::DeduplicationTimeout { timeout_ms, .. }) => {
            registry.stats.timeouts += 1;
            registry.echoes.remove(key);
            warn!(key = %key, timeout_ms, "In-flight execution evicted after maximum lifetime");
        }
        Err(e) => {
            registry.stats.failures += 1;
            registry.echoes.remove(key);
            debug!(key = %key, error = %e, "Shared execution failed");
        }
    }

    registry.refresh_gauges();
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn dedup(echo_secs: u64, lifetime_secs: u64) -> RequestDeduplicator<u32> {
        RequestDeduplicator::new(DedupConfig {
            echo_window: Duration::from_secs(echo_secs),
            max_lifetime: Duration::from_secs(lifetime_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = dedup(30, 30);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .execute_or_join("k", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let coalesced = handle.await.unwrap().unwrap();
            assert_eq!(coalesced.value, 7);
            if coalesced.role == DedupRole::Leader {
                leaders += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);

        let stats = dedup.stats();
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.deduplicated_requests, 9);
        assert_eq!(stats.concurrent_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_is_not_echoed() {
        let dedup = dedup(30, 30);
        let gate = Arc::new(Notify::new());

        let leader = {
            let dedup = dedup.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                dedup
                    .execute_or_join("k", move || async move {
                        gate.notified().await;
                        Err(anyhow!("upstream down"))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        while dedup.subscribers("k").is_none() {
            tokio::task::yield_now().await;
        }

        let joiner = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.execute_or_join("k", || async { Ok(1) }).await })
        };
        while dedup.subscribers("k") != Some(2) {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let a = leader.await.unwrap().unwrap_err();
        let b = joiner.await.unwrap().unwrap_err();
        assert!(a.same_failure(&b));
        assert_eq!(a.to_string(), "upstream down");

        // The next call runs the operation again.
        let retry = dedup.execute_or_join("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(retry.value, 2);
        assert_eq!(retry.role, DedupRole::Leader);
        assert_eq!(dedup.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_window_replays_then_expires() {
        let dedup = dedup(30, 30);

        let first = dedup.execute_or_join("k", || async { Ok(1) }).await.unwrap();
        assert_eq!(first.role, DedupRole::Leader);

        let echoed = dedup.execute_or_join("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(echoed.value, 1);
        assert_eq!(echoed.role, DedupRole::Echoed);

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = dedup.execute_or_join("k", || async { Ok(3) }).await.unwrap();
        assert_eq!(fresh.value, 3);
        assert_eq!(fresh.role, DedupRole::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_marked_once_is_shared_but_not_replayed() {
        let dedup = dedup(30, 30);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .execute_or_join_settled("k", Duration::from_secs(30), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(Settled::once(7))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.stats().echo_entries, 0);

        let fresh = dedup.execute_or_join("k", || async { Ok(8) }).await.unwrap();
        assert_eq!(fresh.role, DedupRole::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_echo_window_per_call() {
        let dedup = dedup(30, 30);

        dedup
            .execute_or_join_within("k", Duration::from_secs(5), || async { Ok(1) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = dedup.execute_or_join("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(fresh.role, DedupRole::Leader);

        // A zero window never echoes.
        dedup
            .execute_or_join_within("z", Duration::ZERO, || async { Ok(1) })
            .await
            .unwrap();
        let again = dedup.execute_or_join("z", || async { Ok(2) }).await.unwrap();
        assert_eq!(again.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_echo() {
        let dedup = dedup(30, 30);
        dedup.execute_or_join("k", || async { Ok(1) }).await.unwrap();

        dedup.forget(["k"]);
        let again = dedup.execute_or_join("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(again.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_execution_times_out() {
        let dedup = dedup(30, 5);

        let err = dedup
            .execute_or_join("k", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OptimizeError::DeduplicationTimeout { timeout_ms: 5000, .. }));
        assert_eq!(dedup.in_flight_count(), 0);
        assert_eq!(dedup.stats().timeouts, 1);

        let retry = dedup.execute_or_join("k", || async { Ok(9) }).await.unwrap();
        assert_eq!(retry.value, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_is_reported_as_error() {
        let dedup = dedup(30, 30);
        let err = dedup
            .execute_or_join("k", || async {
                if true {
                    panic!("boom");
                }
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(err.operation_error().is_some());
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_caller_leaving_cancels_execution() {
        let dedup = dedup(30, 30);
        let finished = Arc::new(AtomicUsize::new(0));

        let caller = {
            let dedup = dedup.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                dedup
                    .execute_or_join("k", move || async move {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };
        while dedup.subscribers("k").is_none() {
            tokio::task::yield_now().await;
        }

        caller.abort();
        let _ = caller.await;

        assert_eq!(dedup.in_flight_count(), 0);
        assert_eq!(dedup.stats().cancelled, 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_caller_leaving_keeps_execution_alive() {
        let dedup = dedup(30, 30);

        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute_or_join("k", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(5)
                    })
                    .await
            })
        };
        while dedup.subscribers("k").is_none() {
            tokio::task::yield_now().await;
        }
        let joiner = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.execute_or_join("k", || async { Ok(0) }).await })
        };
        while dedup.subscribers("k") != Some(2) {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let _ = leader.await;
        assert_eq!(dedup.subscribers("k"), Some(1));

        let joined = joiner.await.unwrap().unwrap();
        assert_eq!(joined.value, 5);
        assert_eq!(joined.role, DedupRole::Joined);
        assert_eq!(dedup.stats().cancelled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_echoes() {
        let dedup = dedup(10, 30);
        dedup.execute_or_join("a", || async { Ok(1) }).await.unwrap();
        dedup.execute_or_join("b", || async { Ok(2) }).await.unwrap();
        assert_eq!(dedup.stats().echo_entries, 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(dedup.purge_expired_echoes(), 2);
        assert_eq!(dedup.stats().echo_entries, 0);
    }
}
