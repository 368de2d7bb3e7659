//! Internal condition variable used by the semaphore's background cleanup
//! task so `shutdown()` can interrupt its sleep immediately instead of
//! waiting out the rest of the cleanup interval.
//!
//! Unlike `std::sync::Condvar`, this is standalone (no paired mutex) and
//! works with compio's async runtime: waiting suspends a task rather than
//! blocking a thread. `notified` never resets once set — this is a
//! one-shot shutdown signal, not a general-purpose reusable condvar — so
//! `wait()` only ever needs to register once.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};

use atomic_waker::AtomicWaker;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

/// Which waiter storage is live. The common case is a single waiter (the
/// cleanup task itself); a second concurrent `wait()` migrates both into
/// the multi queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum Mode {
    Empty = 0,
    Single = 1,
    Multi = 2,
}

/// Waiter registration storage backing [`Condvar`]. Not generic over an
/// arbitrary condition: it's registered and woken directly against
/// `Condvar::notified`, since that's the only condition this crate ever
/// needs a waiter queue for.
struct Waiters {
    mode: AtomicU8,
    single: AtomicWaker,
    multi: Mutex<VecDeque<Waker>>,
}

impl Waiters {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(Mode::Empty.into()),
            single: AtomicWaker::new(),
            multi: Mutex::new(VecDeque::new()),
        }
    }

    fn load_mode(&self, ordering: Ordering) -> Mode {
        Mode::try_from(self.mode.load(ordering)).expect("mode is only ever written from this enum")
    }

    fn store_mode(&self, mode: Mode, ordering: Ordering) {
        self.mode.store(mode.into(), ordering);
    }

    /// Register `waker` unless `notified` is already set, atomically: the
    /// check, registration, and a re-check afterward all happen without a
    /// gap a concurrent `notify` could land in and be lost. Returns `true`
    /// if `notified` was observed set at any point, in which case the
    /// caller should treat this as already-resolved rather than pending.
    fn register_unless_notified(&self, notified: &AtomicBool, waker: &Waker) -> bool {
        if notified.load(Ordering::Acquire) {
            return true;
        }

        let claimed_single = self.load_mode(Ordering::Acquire) == Mode::Empty
            && self
                .mode
                .compare_exchange(
                    Mode::Empty.into(),
                    Mode::Single.into(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();

        if claimed_single {
            self.single.register(waker);
            if notified.load(Ordering::Acquire) {
                self.single.take();
                self.store_mode(Mode::Empty, Ordering::Release);
                return true;
            }
            return false;
        }

        let mut multi = self.multi.lock();
        if let Some(prev) = self.single.take() {
            multi.push_back(prev);
        }
        multi.push_back(waker.clone());
        self.store_mode(Mode::Multi, Ordering::Release);
        drop(multi);

        if notified.load(Ordering::Acquire) {
            // Can't cheaply pop our own entry back out of the multi
            // queue; waking everyone is harmless since `wait()` only
            // resolves once `notified` is actually set.
            self.wake_all();
            return true;
        }
        false
    }

    fn wake_one(&self) {
        if let Some(waker) = self.multi.lock().pop_front() {
            waker.wake();
            return;
        }
        if let Some(waker) = self.single.take() {
            self.store_mode(Mode::Empty, Ordering::Release);
            waker.wake();
        }
    }

    fn wake_all(&self) {
        let single = self.single.take();
        let rest = std::mem::take(&mut *self.multi.lock());
        self.store_mode(Mode::Empty, Ordering::Release);
        if let Some(waker) = single {
            waker.wake();
        }
        for waker in rest {
            waker.wake();
        }
    }
}

/// An async condition variable. Not part of PipelineKit's public API --
/// used internally to wake the periodic waiter-timeout sweep early.
pub(crate) struct Condvar {
    notified: AtomicBool,
    waiters: Waiters,
}

impl Condvar {
    /// A fresh, not-notified condition variable.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            waiters: Waiters::new(),
        }
    }

    /// Suspend until `notify_one`/`notify_all` is called, or return
    /// immediately if already notified.
    pub(crate) async fn wait(&self) {
        WaitFuture {
            condvar: self,
            registered: false,
        }
        .await
    }

    /// Wake one waiting task. Sets the notified flag regardless, so a
    /// `wait()` racing this call still observes it.
    pub(crate) fn notify_one(&self) {
        self.notified.store(true, Ordering::Release);
        self.waiters.wake_one();
    }

    /// Wake every waiting task.
    pub(crate) fn notify_all(&self) {
        self.notified.store(true, Ordering::Release);
        self.waiters.wake_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

struct WaitFuture<'a> {
    condvar: &'a Condvar,
    registered: bool,
}

impl<'a> Future for WaitFuture<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let condvar = this.condvar;

        if condvar.notified.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if !this.registered {
            this.registered = true;
            if condvar
                .waiters
                .register_unless_notified(&condvar.notified, cx.waker())
            {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}
