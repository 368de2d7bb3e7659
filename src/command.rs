//! Command types and the immutable metadata that travels with them through
//! a pipeline.

use std::time::SystemTime;

/// Marker trait for commands that can flow through a [`crate::pipeline::Pipeline`].
///
/// `Command` and its associated `Result` must be safely transferable
/// across threads, since the pipeline may suspend at a semaphore acquire
/// or at a middleware's own suspension points and resume on another
/// worker.
pub trait Command: Send + 'static {
    /// What executing this command produces on success.
    type Output: Send + 'static;
    /// What a handler or middleware produces on failure. Wrapped in
    /// [`crate::error::PipelineError::Handler`] when it propagates out of
    /// [`crate::pipeline::Pipeline::execute`].
    type Error: Send + 'static;
}

/// Immutable metadata carried by every command as it moves through the
/// chain. Distinct from [`crate::context::CommandContext`], which is the
/// mutable, type-keyed store middleware use to pass data to each other;
/// `CommandMetadata` is the fixed identity of the command itself.
#[derive(Debug, Clone)]
pub struct CommandMetadata {
    /// Unique identifier for this command instance.
    pub id: u64,
    /// When the command was submitted.
    pub submitted_at: SystemTime,
    /// Identifies the caller, if known.
    pub user_id: Option<String>,
    /// Correlates this command with others in the same logical request
    /// (e.g. a distributed trace id supplied by the caller).
    pub correlation_id: Option<String>,
}

static NEXT_COMMAND_ID: IdSource = IdSource::new();

impl CommandMetadata {
    /// Mint metadata with the next id from a process-wide [`IdSource`],
    /// the current time, and no user or correlation id set. Use this when
    /// the caller has no id of its own to supply; use [`CommandMetadata::new`]
    /// when one is already available (e.g. from an upstream system).
    #[must_use]
    pub fn generate() -> Self {
        Self::new(NEXT_COMMAND_ID.next())
    }

    /// Mint metadata with an explicit id, the current time, and no user or
    /// correlation id set.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            submitted_at: SystemTime::now(),
            user_id: None,
            correlation_id: None,
        }
    }

    /// Attach a user identifier.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a correlation identifier.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Process-wide monotonic id source, usable wherever a simple increasing
/// counter is needed. Backs [`CommandMetadata::generate`] and the
/// semaphore's token/waiter/sequence counters (see
/// `crate::semaphore::Inner`), so the same pattern isn't duplicated three
/// times with slightly different orderings.
#[derive(Debug)]
pub struct IdSource(std::sync::atomic::AtomicU64);

impl IdSource {
    /// Start a new counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    /// Mint the next id.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_source_is_monotonic() {
        let ids = IdSource::new();
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn generate_mints_distinct_ids() {
        let a = CommandMetadata::generate();
        let b = CommandMetadata::generate();
        assert_ne!(a.id, b.id);
    }
}
