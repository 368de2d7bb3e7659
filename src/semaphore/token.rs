//! RAII permit handle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use super::BackPressureSemaphore;

const NOT_RELEASED: u8 = 0;
const RELEASED: u8 = 1;

/// Exclusive possession of one permit from a [`BackPressureSemaphore`].
///
/// Releasing is idempotent: calling [`PermitToken::release`] explicitly
/// and then dropping the token only ever returns the permit once.
///
/// `PermitToken` holds a cheap `Arc`-backed clone of the semaphore handle
/// rather than a borrowed reference, so tokens are `'static` and can move
/// freely across spawned tasks — an "arena + index" strategy as an
/// alternative to a non-owning reference, with the semaphore's own
/// `Arc<Inner>` acting as the arena.
pub struct PermitToken {
    semaphore: BackPressureSemaphore,
    id: u64,
    acquired_at: Instant,
    released: AtomicU8,
}

impl PermitToken {
    pub(crate) fn new(semaphore: BackPressureSemaphore, id: u64) -> Self {
        Self {
            semaphore,
            id,
            acquired_at: Instant::now(),
            released: AtomicU8::new(NOT_RELEASED),
        }
    }

    /// This token's unique identifier, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When this permit was acquired.
    #[must_use]
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Release the permit back to the semaphore. Idempotent: a second
    /// call (or the subsequent `Drop`) is a no-op.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(NOT_RELEASED, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.semaphore.fast_path_release();
        }
    }
}

impl Drop for PermitToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BackPressureSemaphore, SemaphoreConfig};

    #[compio::test]
    async fn double_release_is_a_noop() {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let token = sem.try_acquire().unwrap();
        token.release();
        token.release();
        assert_eq!(sem.stats().available, 1);
    }

    #[compio::test]
    async fn drop_after_explicit_release_does_not_double_count() {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        {
            let token = sem.try_acquire().unwrap();
            token.release();
        }
        assert_eq!(sem.stats().available, 1);
    }
}
