//! Bounded-concurrency semaphore with a lock-free fast path, a
//! priority-ordered waiter queue, cancellation, overflow strategies and a
//! lazily-started background cleanup sweep.
//!
//! The fast path generalizes a simple `try_acquire` CAS loop: instead of
//! an unsigned counter that can only represent "permits free",
//! `available_permits` here is signed so a negative value doubles as
//! "number of queued waiters." Everything past the fast path — the heap,
//! its id index, and cancellation/timeout/overflow handling — lives
//! behind one `parking_lot::Mutex`, a single-writer serialized region.

mod config;
pub mod token;
mod waiter;

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use config::{OverflowStrategy, SemaphoreConfig};
pub use token::PermitToken;
pub use waiter::Priority;

use crate::command::IdSource;
use crate::condvar::Condvar;
use crate::error::BackPressureError;
use crate::heap::IndexedHeap;
use waiter::{compare_waiters, Outcome, Waiter, WaiterCompletion};

/// Point-in-time snapshot of semaphore occupancy.
#[derive(Debug, Clone)]
pub struct Stats {
    pub max_concurrency: usize,
    pub max_outstanding: usize,
    pub available: usize,
    pub active_count: usize,
    pub queued_count: usize,
    pub queue_memory_usage: usize,
    pub oldest_waiter_age: Option<Duration>,
}

/// Derived health assessment: healthy when the oldest queued waiter is
/// under 60s old and both queue and memory utilization are under 90%.
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub queue_utilization: f64,
    pub memory_utilization: f64,
    pub oldest_waiter_age: Option<Duration>,
}

struct Serialized {
    waiters: IndexedHeap<Waiter>,
    shutdown_reason: Option<&'static str>,
}

struct Inner {
    config: SemaphoreConfig,
    /// Positive: permits free. Zero: none free, none queued. Negative:
    /// `abs(value)` waiters queued (counter algebra).
    available_permits: AtomicI64,
    drain_scheduled: AtomicBool,
    cleanup_started: AtomicBool,
    shutdown: AtomicBool,
    next_token_id: IdSource,
    next_waiter_id: IdSource,
    sequence: IdSource,
    queued_memory: AtomicUsize,
    serialized: Mutex<Serialized>,
    /// Interrupts the cleanup sweep's sleep as soon as `shutdown()` is
    /// called, instead of waiting out the last `cleanup_interval`.
    cleanup_shutdown: Condvar,
}

/// A bounded permit allocator. Cheap to clone — internally an
/// `Arc<Inner>` — so it can be shared across middleware/pipeline
/// components without wrapping it in an `Arc` yourself.
pub struct BackPressureSemaphore {
    inner: Arc<Inner>,
}

impl Clone for BackPressureSemaphore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl BackPressureSemaphore {
    /// Build a new semaphore. See [`SemaphoreConfig::new`] for defaults.
    #[must_use]
    pub fn new(config: SemaphoreConfig) -> Self {
        let initial = config.max_concurrency as i64;
        Self {
            inner: Arc::new(Inner {
                config,
                available_permits: AtomicI64::new(initial),
                drain_scheduled: AtomicBool::new(false),
                cleanup_started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                next_token_id: IdSource::new(),
                next_waiter_id: IdSource::new(),
                sequence: IdSource::new(),
                queued_memory: AtomicUsize::new(0),
                serialized: Mutex::new(Serialized {
                    waiters: IndexedHeap::new(compare_waiters),
                    shutdown_reason: None,
                }),
                cleanup_shutdown: Condvar::new(),
            }),
        }
    }

    /// Fast-path-only acquire: never enqueues, returns immediately.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PermitToken> {
        self.fast_try_acquire()
    }

    fn fast_try_acquire(&self) -> Option<PermitToken> {
        let mut current = self.inner.available_permits.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.inner.available_permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.issue_token()),
                Err(actual) => current = actual,
            }
        }
    }

    fn issue_token(&self) -> PermitToken {
        let id = self.inner.next_token_id.next();
        PermitToken::new(self.clone(), id)
    }

    /// Acquire a permit, waiting if none are immediately available.
    /// `priority` places this waiter in the queue; `estimated_size` is
    /// charged against `max_queue_memory` while queued.
    pub async fn acquire(
        &self,
        priority: Priority,
        estimated_size: usize,
    ) -> Result<PermitToken, BackPressureError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(BackPressureError::ShutdownInFlight);
        }
        if let Some(token) = self.fast_try_acquire() {
            return Ok(token);
        }
        self.acquire_slow(priority, estimated_size).await
    }

    /// Race `acquire` against a deadline. On timeout, the pending acquire
    /// is dropped, which (via `AcquireWait`'s `Drop` impl) routes through
    /// `cancel_waiter` exactly like any other cancellation.
    pub async fn acquire_with_timeout(
        &self,
        duration: Duration,
        priority: Priority,
        estimated_size: usize,
    ) -> Result<PermitToken, BackPressureError> {
        match compio::time::timeout(duration, self.acquire(priority, estimated_size)).await {
            Ok(result) => result,
            Err(_) => Err(BackPressureError::Timeout(duration)),
        }
    }

    async fn acquire_slow(
        &self,
        priority: Priority,
        estimated_size: usize,
    ) -> Result<PermitToken, BackPressureError> {
        let waiter_id;
        let completion;
        {
            let mut guard = self.inner.serialized.lock();
            if guard.shutdown_reason.is_some() {
                return Err(BackPressureError::ShutdownInFlight);
            }

            self.enforce_overflow(&mut guard, estimated_size)?;

            let prev = self.inner.available_permits.fetch_sub(1, Ordering::AcqRel);
            if prev > 0 {
                // A permit was freed between the fast-path check and
                // taking the lock; take it directly, no need to queue.
                return Ok(self.issue_token());
            }

            waiter_id = self.inner.next_waiter_id.next();
            let sequence = self.inner.sequence.next();
            completion = Arc::new(WaiterCompletion::new());
            let was_empty = guard.waiters.is_empty();

            guard.waiters.insert(Waiter {
                id: waiter_id,
                enqueued_at: Instant::now(),
                sequence,
                priority,
                estimated_size,
                completion: Arc::clone(&completion),
            });
            self.inner
                .queued_memory
                .fetch_add(estimated_size, Ordering::Relaxed);

            if was_empty {
                self.maybe_start_cleanup();
            }
        }

        let outcome = AcquireWait {
            semaphore: self,
            waiter_id,
            completion,
            done: false,
        }
        .await;

        match outcome {
            Outcome::Granted(token_id) => Ok(PermitToken::new(self.clone(), token_id)),
            Outcome::Failed(err) => Err(err),
        }
    }

    /// Queue-limit and overflow-strategy enforcement, called while
    /// holding the serialized lock, before the slow-path decrement.
    fn enforce_overflow(
        &self,
        guard: &mut Serialized,
        estimated_size: usize,
    ) -> Result<(), BackPressureError> {
        let cfg = &self.inner.config;

        if let Some(max_mem) = cfg.max_queue_memory {
            let current = self.inner.queued_memory.load(Ordering::Relaxed);
            if current + estimated_size > max_mem {
                return Err(BackPressureError::MemoryPressure);
            }
        }

        let queued = guard.waiters.len();

        match cfg.strategy {
            OverflowStrategy::Suspend => {
                let ceiling = cfg.hard_ceiling();
                if queued >= ceiling {
                    return Err(BackPressureError::QueueFull {
                        current: queued,
                        limit: ceiling,
                    });
                }
                Ok(())
            }
            OverflowStrategy::DropOldest => {
                if self.outstanding(queued) >= cfg.max_outstanding {
                    if let Some(victim) = self.evict_worst(guard) {
                        victim.completion.resolve(Outcome::Failed(
                            BackPressureError::CommandDropped {
                                reason: "evicted by DropOldest overflow strategy".to_string(),
                            },
                        ));
                        self.inner
                            .queued_memory
                            .fetch_sub(victim.estimated_size, Ordering::Relaxed);
                    }
                }
                Ok(())
            }
            OverflowStrategy::DropNewest => {
                if self.outstanding(queued) >= cfg.max_outstanding {
                    return Err(BackPressureError::CommandDropped {
                        reason: "rejected by DropNewest overflow strategy".to_string(),
                    });
                }
                Ok(())
            }
            OverflowStrategy::Error(timeout) => {
                if self.outstanding(queued) >= cfg.max_outstanding && timeout.is_none() {
                    return Err(BackPressureError::QueueFull {
                        current: queued,
                        limit: cfg.max_outstanding,
                    });
                }
                Ok(())
            }
        }
    }

    fn outstanding(&self, queued: usize) -> usize {
        let free = self.inner.available_permits.load(Ordering::Acquire).max(0) as usize;
        let active = self.inner.config.max_concurrency.saturating_sub(free);
        active + queued
    }

    /// Evict the worst candidate for eviction: lowest priority tier, and
    /// within that tier, the one that has been waiting longest.
    fn evict_worst(&self, guard: &mut Serialized) -> Option<Waiter> {
        let victim_id = guard
            .waiters
            .iter()
            .max_by_key(|w| (w.priority.rank(), Reverse(w.sequence)))
            .map(|w| w.id)?;
        guard.waiters.remove_by_id(victim_id)
    }

    /// Called from [`PermitToken::release`] (and its `Drop`). Never
    /// suspends.
    pub(crate) fn fast_path_release(&self) {
        let prev = self.inner.available_permits.fetch_add(1, Ordering::AcqRel);
        if prev >= 0 {
            return; // nobody was queued
        }
        self.try_schedule_drain();
    }

    fn try_schedule_drain(&self) {
        if self
            .inner
            .drain_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // The serialized region is a plain mutex, not an actor tied
            // to its own task, so draining runs inline on the releasing
            // thread rather than being handed to a spawned task.
            self.drain_waiters();
        }
    }

    fn drain_waiters(&self) {
        let mut guard = self.inner.serialized.lock();
        loop {
            let Some(top) = guard.waiters.peek() else {
                break;
            };
            if top.completion.is_resolved() {
                let id = top.id;
                guard.waiters.remove_by_id(id);
                continue;
            }

            let current = self.inner.available_permits.load(Ordering::Acquire);
            if current <= 0 {
                break;
            }
            if self
                .inner
                .available_permits
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue; // lost a race with a concurrent fast-path acquire; retry
            }

            let waiter = guard.waiters.extract_min().expect("peeked Some above");
            self.inner
                .queued_memory
                .fetch_sub(waiter.estimated_size, Ordering::Relaxed);
            let token_id = self.inner.next_token_id.next();
            tracing::debug!(waiter_id = waiter.id, token_id, "drained waiter");
            waiter.completion.resolve(Outcome::Granted(token_id));
        }
        self.inner.drain_scheduled.store(false, Ordering::Release);

        // Close the race where a permit was released (or a cancel
        // restored the counter) right as we reset the flag above.
        if self.inner.available_permits.load(Ordering::Acquire) > 0 && !guard.waiters.is_empty() {
            drop(guard);
            self.try_schedule_drain();
        }
    }

    fn cancel_waiter(&self, waiter_id: u64) {
        let mut guard = self.inner.serialized.lock();
        if let Some(waiter) = guard.waiters.remove_by_id(waiter_id) {
            self.inner
                .queued_memory
                .fetch_sub(waiter.estimated_size, Ordering::Relaxed);
            waiter
                .completion
                .resolve(Outcome::Failed(BackPressureError::Cancelled));
            drop(guard);
            self.inner.available_permits.fetch_add(1, Ordering::AcqRel);
            self.try_schedule_drain();
        }
        // Not found: already resolved by a concurrent drain/timeout/
        // shutdown, which already restored the counter. Nothing to do.
    }

    fn maybe_start_cleanup(&self) {
        if self
            .inner
            .cleanup_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let semaphore = self.clone();
            compio::runtime::spawn(async move {
                semaphore.cleanup_loop().await;
            })
            .detach();
        }
    }

    async fn cleanup_loop(&self) {
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let interrupted = compio::time::timeout(
                self.inner.config.cleanup_interval,
                self.inner.cleanup_shutdown.wait(),
            )
            .await
            .is_ok();
            if interrupted {
                return;
            }
            self.sweep_expired();
        }
    }

    fn sweep_expired(&self) {
        let mut guard = self.inner.serialized.lock();
        let now = Instant::now();
        let timeout = self.inner.config.waiter_timeout;
        let expired: Vec<u64> = guard
            .waiters
            .iter()
            .filter(|w| now.duration_since(w.enqueued_at) > timeout)
            .map(|w| w.id)
            .collect();
        let mut count = 0usize;
        for id in expired {
            if let Some(waiter) = guard.waiters.remove_by_id(id) {
                count += 1;
                self.inner
                    .queued_memory
                    .fetch_sub(waiter.estimated_size, Ordering::Relaxed);
                waiter
                    .completion
                    .resolve(Outcome::Failed(BackPressureError::Timeout(timeout)));
                self.inner.available_permits.fetch_add(1, Ordering::AcqRel);
            }
        }
        drop(guard);
        if count > 0 {
            tracing::debug!(count, "cleanup sweep expired waiters");
            self.try_schedule_drain();
        }
    }

    /// Shut down the semaphore: cancel the cleanup task, resolve every
    /// pending waiter with [`BackPressureError::ShutdownInFlight`], and
    /// reject all subsequent acquires. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.inner.serialized.lock();
        guard.shutdown_reason = Some("semaphore shut down");
        while let Some(waiter) = guard.waiters.extract_min() {
            self.inner
                .queued_memory
                .fetch_sub(waiter.estimated_size, Ordering::Relaxed);
            waiter
                .completion
                .resolve(Outcome::Failed(BackPressureError::ShutdownInFlight));
        }
        drop(guard);
        self.inner.cleanup_shutdown.notify_all();
    }

    /// Point-in-time occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let guard = self.inner.serialized.lock();
        let free = self.inner.available_permits.load(Ordering::Acquire).max(0) as usize;
        let active = self.inner.config.max_concurrency.saturating_sub(free);
        let oldest_waiter_age = guard.waiters.iter().map(|w| w.enqueued_at.elapsed()).max();
        Stats {
            max_concurrency: self.inner.config.max_concurrency,
            max_outstanding: self.inner.config.max_outstanding,
            available: free,
            active_count: active,
            queued_count: guard.waiters.len(),
            queue_memory_usage: self.inner.queued_memory.load(Ordering::Relaxed),
            oldest_waiter_age,
        }
    }

    /// Derived health assessment; see [`Health`].
    #[must_use]
    pub fn health(&self) -> Health {
        let stats = self.stats();
        let queue_utilization = if stats.max_outstanding == 0 {
            1.0
        } else {
            stats.queued_count as f64 / stats.max_outstanding as f64
        };
        let memory_utilization = match self.inner.config.max_queue_memory {
            Some(max) if max > 0 => stats.queue_memory_usage as f64 / max as f64,
            Some(_) => 1.0,
            None => 0.0,
        };
        let oldest_ok = stats
            .oldest_waiter_age
            .is_none_or(|age| age < Duration::from_secs(60));
        let healthy = oldest_ok && queue_utilization < 0.9 && memory_utilization < 0.9;
        Health {
            healthy,
            queue_utilization,
            memory_utilization,
            oldest_waiter_age: stats.oldest_waiter_age,
        }
    }
}

/// Future returned by `acquire_slow`'s suspension point. Its `Drop` impl
/// is the cancellation hook: if the task awaiting this future is dropped
/// (explicit cancel, a `select!` losing branch, or a timeout combinator
/// giving up) before the waiter resolved, the waiter is removed from the
/// heap and the permit counter is restored.
struct AcquireWait<'a> {
    semaphore: &'a BackPressureSemaphore,
    waiter_id: u64,
    completion: Arc<WaiterCompletion>,
    done: bool,
}

impl<'a> std::future::Future for AcquireWait<'a> {
    type Output = Outcome;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Outcome> {
        let this = self.get_mut();
        match this.completion.poll(cx.waker()) {
            std::task::Poll::Ready(outcome) => {
                this.done = true;
                std::task::Poll::Ready(outcome)
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl<'a> Drop for AcquireWait<'a> {
    fn drop(&mut self) {
        if !self.done {
            self.semaphore.cancel_waiter(self.waiter_id);
        }
    }
}
