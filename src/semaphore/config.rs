//! Semaphore configuration.

use std::time::Duration;

const DEFAULT_WAITER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// What happens when an `acquire` would push the waiter queue past
/// `max_outstanding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Enqueue regardless, up to a hard safety ceiling of `2 * max_outstanding`.
    Suspend,
    /// Evict the lowest-priority/oldest queued waiter to make room.
    DropOldest,
    /// Reject the incoming acquire immediately.
    DropNewest,
    /// Fail immediately if `None`; otherwise enqueue and let the waiter
    /// expire via the usual `waiter_timeout` cleanup sweep.
    Error(Option<Duration>),
}

/// Configuration for a [`super::BackPressureSemaphore`].
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Maximum permits in flight at once. Must be >= 1.
    pub max_concurrency: usize,
    /// Maximum of active + queued before the overflow strategy engages.
    pub max_outstanding: usize,
    /// Optional ceiling on the estimated byte size of queued waiters.
    pub max_queue_memory: Option<usize>,
    /// Behavior once `max_outstanding` is exceeded.
    pub strategy: OverflowStrategy,
    /// How long a queued waiter may wait before the cleanup sweep expires it.
    pub waiter_timeout: Duration,
    /// How often the background cleanup sweep runs.
    pub cleanup_interval: Duration,
}

impl SemaphoreConfig {
    /// Defaults matching: `max_outstanding = 10 * max_concurrency`,
    /// `Suspend` strategy, 5 minute waiter timeout, 1 second cleanup interval.
    ///
    /// # Panics
    /// Panics if `max_concurrency == 0`.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        assert!(max_concurrency >= 1, "max_concurrency must be at least 1");
        Self {
            max_concurrency,
            max_outstanding: max_concurrency.saturating_mul(10),
            max_queue_memory: None,
            strategy: OverflowStrategy::Suspend,
            waiter_timeout: DEFAULT_WAITER_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Override `max_outstanding`. `0` is accepted and degenerate: every
    /// acquire beyond immediately-available permits is rejected.
    #[must_use]
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    /// Cap the estimated queued-memory footprint.
    #[must_use]
    pub fn with_max_queue_memory(mut self, bytes: usize) -> Self {
        self.max_queue_memory = Some(bytes);
        self
    }

    /// Choose the overflow strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Override the queued-waiter expiry.
    #[must_use]
    pub fn with_waiter_timeout(mut self, timeout: Duration) -> Self {
        self.waiter_timeout = timeout;
        self
    }

    /// Override the cleanup sweep interval.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// The hard safety ceiling under `Suspend`: `2 * max_outstanding`.
    #[must_use]
    pub(crate) fn hard_ceiling(&self) -> usize {
        self.max_outstanding.saturating_mul(2)
    }
}
