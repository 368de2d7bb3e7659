//! Waiter bookkeeping: the priority tier enum, the heap entry, and the
//! single-consumer completion handle a pending `acquire()` polls.

use std::task::{Poll, Waker};
use std::time::Instant;

use atomic_waker::AtomicWaker;
use parking_lot::Mutex;

use crate::error::BackPressureError;
use crate::heap::HeapId;

/// Waiter priority tier. `Critical` is served before `High`,
/// before `Normal`, before `Low`; within a tier, waiters are served FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Lower rank = served first. Used by the heap comparator.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// What a resolved waiter was granted or denied.
pub(crate) enum Outcome {
    /// Granted the permit identified by this token id.
    Granted(u64),
    /// Denied; the acquire future should return this error.
    Failed(BackPressureError),
}

/// Single-consumer completion handle: the serialized region resolves it
/// exactly once (success, cancel, timeout, or shutdown); the
/// pending `acquire()` future polls it.
///
/// Built the same way `condvar::Waiters`' single-waiter fast path is: an
/// `AtomicWaker` plus a small mutex around the outcome slot, registered
/// before a second check to avoid a lost wakeup. Narrowed here to exactly
/// one waiter per handle, since each `Waiter` is its own heap entry
/// rather than a shared FIFO queue.
pub(crate) struct WaiterCompletion {
    waker: AtomicWaker,
    outcome: Mutex<Option<Outcome>>,
}

impl WaiterCompletion {
    pub(crate) fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            outcome: Mutex::new(None),
        }
    }

    /// Resolve exactly once. Called from inside the serialized region.
    /// A second call is ignored (the first writer wins) so a cancel-drain
    /// race can never double-resolve a waiter.
    pub(crate) fn resolve(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            drop(slot);
            self.waker.wake();
        }
    }

    /// `true` if this waiter has already been resolved (used by the
    /// drain loop to skip entries that lost a cancel race).
    pub(crate) fn is_resolved(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub(crate) fn poll(&self, cx_waker: &Waker) -> Poll<Outcome> {
        if let Some(o) = self.outcome.lock().take() {
            return Poll::Ready(o);
        }
        self.waker.register(cx_waker);
        if let Some(o) = self.outcome.lock().take() {
            return Poll::Ready(o);
        }
        Poll::Pending
    }
}

/// An enqueued acquisition request.
pub(crate) struct Waiter {
    pub id: u64,
    pub enqueued_at: Instant,
    pub sequence: u64,
    pub priority: Priority,
    pub estimated_size: usize,
    pub completion: std::sync::Arc<WaiterCompletion>,
}

impl HeapId for Waiter {
    type Id = u64;
    fn heap_id(&self) -> u64 {
        self.id
    }
}

/// Comparator installed on the heap: priority rank ascending, then
/// sequence number ascending (strict FIFO within a tier even if two
/// waiters share a timestamp).
pub(crate) fn compare_waiters(a: &Waiter, b: &Waiter) -> std::cmp::Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.sequence.cmp(&b.sequence))
}
