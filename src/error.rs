//! Error taxonomy for the back-pressure, pipeline and contract-violation
//! failure paths.
//!
//! These are error *kinds*, not opaque strings: callers match on variants
//! to decide whether to retry, surface to a user, or treat as fatal.

use std::time::Duration;

/// Failures produced by [`crate::semaphore::BackPressureSemaphore`].
#[derive(Debug, thiserror::Error)]
pub enum BackPressureError {
    /// The waiter queue (or its hard safety ceiling) is full.
    #[error("queue full: {current} waiters queued, limit {limit}")]
    QueueFull {
        /// Current queue depth at the time of rejection.
        current: usize,
        /// The limit that was exceeded.
        limit: usize,
    },

    /// Admitting this acquire would exceed `max_queue_memory`.
    #[error("queue memory pressure: would exceed configured limit")]
    MemoryPressure,

    /// A waiter was evicted by an overflow strategy before it could acquire.
    #[error("command dropped from queue: {reason}")]
    CommandDropped {
        /// Human-readable eviction reason (e.g. "evicted by DropOldest").
        reason: String,
    },

    /// A waiter aged out past `waiter_timeout` (or a caller-supplied
    /// deadline via `acquire_with_timeout`) before it could acquire.
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),

    /// The semaphore was shut down while this acquire was pending or is
    /// shut down at call time.
    #[error("semaphore is shut down")]
    ShutdownInFlight,

    /// The task awaiting this acquire was cancelled.
    #[error("acquire was cancelled")]
    Cancelled,
}

impl BackPressureError {
    /// `true` for errors produced by an overflow strategy shedding load,
    /// as opposed to cancellation/shutdown/timeout.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::MemoryPressure | Self::CommandDropped { .. }
        )
    }
}

/// Violations of the middleware `next` contract.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    /// `next` was called a second time after the first call had already
    /// finished — a genuine sequential double-call bug in the middleware.
    #[error("next() was called more than once")]
    NextCalledTwice,

    /// `next` was called a second time while the first call was still
    /// running, e.g. two clones of the same `Next` raced via `join!` or
    /// two spawned tasks. Only the winner of the race proceeds.
    #[error("next() was called concurrently by a second racing caller")]
    NextCalledConcurrently,

    /// A side-effect middleware invoked `next` while running isolated (the
    /// parallel executor's concurrent stage), where there is no downstream
    /// chain to continue into.
    #[error("a side-effect middleware called next(), but it has no downstream chain to continue")]
    SideEffectCalledNext,
}

/// Top-level error surfaced by [`crate::pipeline::Pipeline::execute`] and
/// [`crate::parallel::ParallelExecutor::execute`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E> {
    /// Failed to acquire a concurrency permit before running the chain.
    #[error("back-pressure: {0}")]
    BackPressure(#[from] BackPressureError),

    /// A middleware violated the `next` contract.
    #[error("contract violation: {0}")]
    Contract(ContractViolation),

    /// The handler or a middleware returned an application error.
    #[error("handler error")]
    Handler(#[source] E),

    /// Raised by the parallel executor when a `FailFast` stage aborts.
    /// Carries every failure observed before the stage's remaining
    /// siblings were cancelled — ordinarily one, but more than one can
    /// land here if several siblings fail in the same poll before
    /// cancellation takes effect.
    #[error("stage failed: {0:?}")]
    StageFailed(Vec<String>),
}

impl<E> PipelineError<E> {
    /// Unwrap the inner handler/middleware error, if that's what this is.
    pub fn into_handler_error(self) -> Option<E> {
        match self {
            Self::Handler(e) => Some(e),
            _ => None,
        }
    }
}
