//! Rate-limited request queue with result caching.
//!
//! Every outbound provider call goes through a [`RateLimiter`]:
//!
//! 1. A live cache entry for the key is returned immediately.
//! 2. Otherwise the call is queued, ordered by `(priority desc, enqueue order asc)`.
//! 3. A drain worker dispatches the queue head whenever the rolling one-minute
//!    window (and the one-second burst window) has room, sleeping until the
//!    oldest timestamp ages out when it does not. The worker is spawned on
//!    demand and exits once the queue is empty.
//! 4. Quota errors re-queue the item with a bumped priority and pause the
//!    worker for an exponential backoff. Other errors go straight back to the
//!    caller. Successes are cached with the caller's TTL.
//!
//! Cancelling the caller's token, or dropping the `schedule` future, removes
//! the item from the queue and aborts it if it is in flight.
//!
//! Concurrent calls with the same cache key share one dispatch: later callers
//! wait for the first one's result. If the first call fails they each make
//! their own attempt. A limiter with `requests_per_minute == 0` never
//! dispatches.

pub mod backoff;
pub mod cache;
pub mod window;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::ocr::ProviderError;
use backoff::BackoffPolicy;
use cache::{CacheEntry, ResultCache};
use window::RateWindow;

/// Tunables for one limiter instance.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub requests_per_minute: usize,
    /// Max dispatches per rolling second; 0 disables the burst check.
    pub burst_limit: usize,
    pub queue_max_size: usize,
    /// Rate-limit retries before the caller gets a terminal error.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub cache_capacity: usize,
}

impl LimiterSettings {
    pub fn from_config(rate: &RateLimitSettings, queue_max_size: usize, cache_capacity: usize) -> Self {
        Self {
            requests_per_minute: rate.requests_per_minute,
            burst_limit: rate.burst_limit,
            queue_max_size,
            max_retries: rate.queue_retries,
            backoff: BackoffPolicy::new(
                Duration::from_millis(rate.backoff_base_ms),
                Duration::from_millis(rate.cooldown_period_ms),
            ),
            cache_capacity,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("{operation}: request cancelled")]
    Cancelled { operation: String },
    #[error("{operation}: queue is full ({capacity} pending)")]
    QueueFull { operation: String, capacity: usize },
    #[error("{operation}: still rate limited after {attempts} retries: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: ProviderError,
    },
    #[error(transparent)]
    Call(ProviderError),
    #[error("{operation}: queue worker went away")]
    Closed { operation: String },
    #[error("{operation}: requestsPerMinute is 0, calls are disabled")]
    Disabled { operation: String },
}

type QueuedCall<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ProviderError>> + Send + Sync>;

/// One deferred call waiting in (or dispatched from) the queue.
pub struct QueueItem<T> {
    id: u64,
    pub priority: u32,
    pub retry_count: u32,
    pub enqueued_at: Instant,
    cache_key: String,
    ttl: Duration,
    call: QueuedCall<T>,
    reply: oneshot::Sender<Result<T, LimiterError>>,
    cancel: CancellationToken,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    // Max-heap: higher priority first, then lower id (earlier enqueue) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub operation: String,
    pub requests_per_minute: usize,
    pub queue_length: usize,
    pub window_calls: usize,
    pub in_flight: usize,
    pub paused: bool,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dispatched: u64,
    pub rate_limit_retries: u64,
}

struct QueueState<T> {
    queue: BinaryHeap<QueueItem<T>>,
    window: RateWindow,
    paused_until: Option<Instant>,
    worker_running: bool,
    in_flight: usize,
}

enum Step<T> {
    Idle,
    Wait(Instant),
    Dispatch(QueueItem<T>),
}

struct Shared<T> {
    operation: String,
    settings: LimiterSettings,
    state: Mutex<QueueState<T>>,
    cache: Mutex<ResultCache<T>>,
    /// Cache keys with a call queued or running, and the callers waiting on it.
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>,
    wake: Notify,
    next_id: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    dispatched: AtomicU64,
    rate_limit_retries: AtomicU64,
}

/// Per-operation rate limiter backed by an LRU cache and a priority queue.
pub struct RateLimiter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RateLimiter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> RateLimiter<T> {
    pub fn new(operation: impl Into<String>, settings: LimiterSettings) -> Self {
        let cache = ResultCache::new(settings.cache_capacity);
        Self {
            shared: Arc::new(Shared {
                operation: operation.into(),
                settings,
                state: Mutex::new(QueueState {
                    queue: BinaryHeap::new(),
                    window: RateWindow::new(),
                    paused_until: None,
                    worker_running: false,
                    in_flight: 0,
                }),
                cache: Mutex::new(cache),
                inflight: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                next_id: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                rate_limit_retries: AtomicU64::new(0),
            }),
        }
    }

    fn cached(&self, cache_key: &str) -> Option<CacheEntry<T>> {
        lock(&self.shared.cache).get(cache_key, Instant::now())
    }

    /// Run `call` under the rate limit, or answer from cache.
    ///
    /// `call` may be invoked more than once when the provider reports a quota
    /// error. Only successful results are cached.
    pub async fn schedule<F, Fut>(
        &self,
        cache_key: String,
        ttl: Duration,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, LimiterError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        let shared = &self.shared;

        if let Some(hit) = self.cached(&cache_key) {
            shared.cache_hits.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(
                "{}: cache hit {} (computed {:?} ago)",
                shared.operation,
                short_key(&cache_key),
                hit.computed_at.elapsed()
            );
            return Ok(hit.result);
        }
        shared.cache_misses.fetch_add(1, AtomicOrdering::Relaxed);

        if shared.settings.requests_per_minute == 0 {
            return Err(LimiterError::Disabled {
                operation: shared.operation.clone(),
            });
        }

        let joined = {
            let mut inflight = lock(&shared.inflight);
            match inflight.get_mut(&cache_key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(cache_key.clone(), Vec::new());
                    None
                }
            }
        };

        let leader = match joined {
            Some(rx) => {
                debug!("{}: joining in-flight call {}", shared.operation, short_key(&cache_key));
                tokio::select! {
                    shared_result = rx => {
                        if let Ok(value) = shared_result {
                            return Ok(value);
                        }
                        debug!("{}: in-flight call {} failed, retrying alone", shared.operation, short_key(&cache_key));
                    }
                    _ = cancel.cancelled() => return Err(LimiterError::Cancelled {
                        operation: shared.operation.clone(),
                    }),
                }
                None
            }
            None => Some(InflightGuard {
                shared: shared.as_ref(),
                key: cache_key.clone(),
                settled: false,
            }),
        };

        let result = self.enqueue(cache_key, ttl, cancel, call).await;
        if let (Some(leader), Ok(value)) = (leader, &result) {
            leader.share(value);
        }
        result
    }

    async fn enqueue<F, Fut>(
        &self,
        cache_key: String,
        ttl: Duration,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, LimiterError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        let shared = &self.shared;

        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled {
                operation: shared.operation.clone(),
            });
        }

        let call: QueuedCall<T> = Arc::new(move || call().boxed());
        let (reply, rx) = oneshot::channel();
        let id = shared.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let item_cancel = cancel.child_token();

        {
            let mut state = lock(&shared.state);
            if state.queue.len() >= shared.settings.queue_max_size {
                return Err(LimiterError::QueueFull {
                    operation: shared.operation.clone(),
                    capacity: shared.settings.queue_max_size,
                });
            }
            state.queue.push(QueueItem {
                id,
                priority: 0,
                retry_count: 0,
                enqueued_at: Instant::now(),
                cache_key,
                ttl,
                call,
                reply,
                cancel: item_cancel.clone(),
            });
            Shared::ensure_worker(shared, &mut state);
        }
        shared.wake.notify_one();

        // Removes the item from the queue and aborts it however this future ends.
        let _guard = PendingGuard {
            shared: shared.as_ref(),
            id,
            cancel: item_cancel,
        };

        tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| Err(LimiterError::Closed {
                operation: shared.operation.clone(),
            })),
            _ = cancel.cancelled() => Err(LimiterError::Cancelled {
                operation: shared.operation.clone(),
            }),
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let shared = &self.shared;
        let (queue_length, window_calls, in_flight, paused) = {
            let mut state = lock(&shared.state);
            let now = Instant::now();
            state.window.prune(now);
            (
                state.queue.len(),
                state.window.len(),
                state.in_flight,
                state.paused_until.map(|p| p > now).unwrap_or(false),
            )
        };
        LimiterStats {
            operation: shared.operation.clone(),
            requests_per_minute: shared.settings.requests_per_minute,
            queue_length,
            window_calls,
            in_flight,
            paused,
            cache_entries: lock(&shared.cache).len(),
            cache_hits: shared.cache_hits.load(AtomicOrdering::Relaxed),
            cache_misses: shared.cache_misses.load(AtomicOrdering::Relaxed),
            dispatched: shared.dispatched.load(AtomicOrdering::Relaxed),
            rate_limit_retries: shared.rate_limit_retries.load(AtomicOrdering::Relaxed),
        }
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    /// Start the drain worker unless one is already running. Caller holds the state lock.
    fn ensure_worker(this: &Arc<Self>, state: &mut QueueState<T>) {
        if !state.worker_running {
            state.worker_running = true;
            tokio::spawn(drain(Arc::clone(this)));
        }
    }

    fn next_step(&self, state: &mut QueueState<T>, now: Instant) -> Step<T> {
        loop {
            if state.queue.is_empty() {
                state.worker_running = false;
                return Step::Idle;
            }

            if let Some(until) = state.paused_until {
                if now < until {
                    return Step::Wait(until);
                }
                state.paused_until = None;
            }

            state.window.prune(now);
            if let Some(until) = state.window.next_slot(
                now,
                self.settings.requests_per_minute,
                self.settings.burst_limit,
            ) {
                return Step::Wait(until);
            }

            let Some(item) = state.queue.pop() else {
                continue;
            };
            if item.cancel.is_cancelled() || item.reply.is_closed() {
                continue;
            }

            state.window.record(now);
            state.in_flight += 1;
            self.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
            return Step::Dispatch(item);
        }
    }
}

/// Drain loop: one per limiter while the queue is non-empty.
async fn drain<T: Clone + Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let step = {
            let mut state = lock(&shared.state);
            shared.next_step(&mut state, Instant::now())
        };

        match step {
            Step::Idle => return,
            Step::Wait(until) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            Step::Dispatch(item) => {
                debug!(
                    "{}: dispatching item {} (priority {}, retry {}, queued {:?})",
                    shared.operation,
                    item.id,
                    item.priority,
                    item.retry_count,
                    item.enqueued_at.elapsed()
                );
                tokio::spawn(run_item(Arc::clone(&shared), item));
            }
        }
    }
}

async fn run_item<T: Clone + Send + 'static>(shared: Arc<Shared<T>>, mut item: QueueItem<T>) {
    let outcome = tokio::select! {
        result = (item.call)() => Some(result),
        _ = item.cancel.cancelled() => None,
    };

    {
        let mut state = lock(&shared.state);
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            let _ = item.reply.send(Err(LimiterError::Cancelled {
                operation: shared.operation.clone(),
            }));
            return;
        }
    };

    match outcome {
        Ok(value) => {
            lock(&shared.cache).put(item.cache_key.clone(), value.clone(), item.ttl, Instant::now());
            let _ = item.reply.send(Ok(value));
        }
        Err(e) if e.is_rate_limited() => {
            if item.retry_count >= shared.settings.max_retries {
                warn!(
                    "{}: giving up after {} rate-limit retries: {}",
                    shared.operation, item.retry_count, e
                );
                let _ = item.reply.send(Err(LimiterError::RetriesExhausted {
                    operation: shared.operation.clone(),
                    attempts: item.retry_count,
                    last_error: e,
                }));
                return;
            }

            item.retry_count += 1;
            item.priority += 1;
            let wait = shared.settings.backoff.delay(item.retry_count);
            shared.rate_limit_retries.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                "{}: rate limited, retry {} in {:?}: {}",
                shared.operation, item.retry_count, wait, e
            );

            {
                let mut state = lock(&shared.state);
                let until = Instant::now() + wait;
                state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
                state.queue.push(item);
                Shared::ensure_worker(&shared, &mut state);
            }
            shared.wake.notify_one();
        }
        Err(e) => {
            let _ = item.reply.send(Err(LimiterError::Call(e)));
        }
    }
}

/// Owns a cache key's in-flight slot. Dropping it without sharing a result
/// releases the waiters to try on their own.
struct InflightGuard<'a, T> {
    shared: &'a Shared<T>,
    key: String,
    settled: bool,
}

impl<T: Clone> InflightGuard<'_, T> {
    fn share(mut self, value: &T) {
        let waiters = lock(&self.shared.inflight).remove(&self.key).unwrap_or_default();
        self.settled = true;
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

impl<T> Drop for InflightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.shared.inflight).remove(&self.key);
        }
    }
}

struct PendingGuard<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    cancel: CancellationToken,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let removed = {
            let mut state = lock(&self.shared.state);
            let before = state.queue.len();
            let id = self.id;
            state.queue.retain(|item| item.id != id);
            before != state.queue.len()
        };
        if removed {
            debug!("{}: removed abandoned item {}", self.shared.operation, self.id);
            self.shared.wake.notify_one();
        }
    }
}

fn short_key(key: &str) -> &str {
    &key[..key.len().min(12)]
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
