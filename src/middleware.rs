//! The middleware contract: priority-ordered execution and the
//! at-most-once `next` continuation guarantee.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::Command;
use crate::context::CommandContext;
use crate::error::{ContractViolation, PipelineError};
use crate::pipeline::Chain;

const NOT_CALLED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

/// Enforces that a middleware's `next` continuation is invoked at most
/// once, and distinguishes *how* a second call happened. The state is a
/// three-value machine rather than a boolean so a racing caller (the
/// chain is still running) and a sequential re-call (the chain already
/// finished) get different [`ContractViolation`] variants.
pub struct NextGuard {
    state: AtomicU8,
    may_short_circuit: bool,
}

impl NextGuard {
    pub(crate) fn new(may_short_circuit: bool) -> Self {
        Self {
            state: AtomicU8::new(NOT_CALLED),
            may_short_circuit,
        }
    }

    /// Attempt to claim the single allowed call. `Ok(())` for the winner,
    /// who must call [`NextGuard::finish`] once the downstream chain
    /// returns. Everyone else gets
    /// [`ContractViolation::NextCalledConcurrently`] if the winner is
    /// still running, or [`ContractViolation::NextCalledTwice`] if the
    /// winner already finished.
    fn try_claim(&self) -> Result<(), ContractViolation> {
        match self
            .state
            .compare_exchange(NOT_CALLED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(IN_PROGRESS) => Err(ContractViolation::NextCalledConcurrently),
            Err(_) => Err(ContractViolation::NextCalledTwice),
        }
    }

    /// Mark the claimed call as finished, so a later call sees
    /// `NextCalledTwice` rather than `NextCalledConcurrently`.
    fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn was_called(&self) -> bool {
        self.state.load(Ordering::Acquire) != NOT_CALLED
    }
}

impl Drop for NextGuard {
    fn drop(&mut self) {
        if !self.was_called() && !self.may_short_circuit {
            // Legal pattern (deliberate short-circuit) unless the
            // middleware opted out via `Middleware::may_short_circuit`.
            // Never a hard failure — just a breadcrumb for debugging.
            #[cfg(debug_assertions)]
            tracing::debug!(
                "middleware dropped `next` without calling it; \
                 if intentional, implement `may_short_circuit` to silence this"
            );
        }
    }
}

/// A middleware's downstream continuation. Calling it runs every
/// remaining middleware and finally the handler. `Next` is `Clone`
/// because the *contract* (at most one successful call) is runtime
/// enforced by the shared [`NextGuard`], not by Rust ownership — a buggy
/// middleware that clones `next` and calls it twice gets
/// [`ContractViolation::NextCalledTwice`] on the second call rather than
/// a silent double execution.
pub struct Next<'a, C: Command> {
    guard: Arc<NextGuard>,
    /// `None` for a middleware run in isolation (the parallel executor's
    /// concurrent side-effect stage) — there is no downstream chain to
    /// continue into, so calling it is a contract violation rather than a
    /// panic or a fabricated result.
    chain: Option<&'a Chain<C>>,
    index: usize,
}

impl<'a, C: Command> Clone for Next<'a, C> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
            chain: self.chain,
            index: self.index,
        }
    }
}

impl<'a, C: Command> Next<'a, C> {
    pub(crate) fn new(guard: Arc<NextGuard>, chain: &'a Chain<C>, index: usize) -> Self {
        Self {
            guard,
            chain: Some(chain),
            index,
        }
    }

    /// Build a `Next` with no downstream chain, for a middleware invoked in
    /// isolation.
    pub(crate) fn new_isolated(guard: Arc<NextGuard>) -> Self {
        Self {
            guard,
            chain: None,
            index: 0,
        }
    }

    /// Invoke the downstream chain. Fails with
    /// [`ContractViolation::NextCalledConcurrently`] if another call
    /// sharing the same guard is still running, with
    /// [`ContractViolation::NextCalledTwice`] if one already finished, or
    /// with [`ContractViolation::SideEffectCalledNext`] if there is no
    /// downstream chain (see [`Next::new_isolated`]).
    pub async fn call(
        self,
        command: C,
        context: &'a CommandContext,
    ) -> Result<C::Output, PipelineError<C::Error>> {
        self.guard.try_claim().map_err(PipelineError::Contract)?;
        let result = match self.chain {
            Some(chain) => chain.invoke(self.index, command, context).await,
            None => Err(PipelineError::Contract(
                ContractViolation::SideEffectCalledNext,
            )),
        };
        self.guard.finish();
        result
    }
}

/// Boxed future alias used throughout the pipeline for
/// `#[async_trait]`-free call sites (the terminal handler and the
/// dependency-aware parallel executor).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An operation in the middleware chain. `priority` determines execution
/// order (ascending, stable for ties).
#[async_trait]
pub trait Middleware<C: Command>: Send + Sync {
    /// Lower runs earlier. Ties keep insertion order.
    fn priority(&self) -> i32;

    /// Whether this middleware type is allowed to drop `next` without
    /// calling it as a deliberate short-circuit, rather than a bug.
    /// Defaults to `false` (dropping `next` unused is suspicious by
    /// default; opt in explicitly).
    fn may_short_circuit(&self) -> bool {
        false
    }

    /// Run this middleware. Implementations call `next.call(command,
    /// context).await` to continue the chain, or return early (dropping
    /// `next`) to short-circuit.
    async fn execute(
        &self,
        command: C,
        context: &CommandContext,
        next: Next<'_, C>,
    ) -> Result<C::Output, PipelineError<C::Error>>;
}

/// Declarative marker for middleware whose purpose is an observable side
/// effect (logging, metrics, tracing) rather than transforming the
/// command or its result. The parallel executor runs
/// `SideEffect` middleware within a stage concurrently and everything
/// else sequentially.
///
/// Chosen as a declarative marker over a name heuristic so classification
/// is deterministic and checkable at compile time rather than guessed.
pub trait SideEffect {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_first_claim_wins() {
        let guard = NextGuard::new(false);
        assert!(guard.try_claim().is_ok());
        assert!(guard.was_called());
    }

    #[test]
    fn concurrent_racer_gets_next_called_concurrently() {
        let guard = NextGuard::new(false);
        assert!(guard.try_claim().is_ok());
        // Winner hasn't called `finish()` yet, so it's still "running".
        assert_eq!(
            guard.try_claim(),
            Err(ContractViolation::NextCalledConcurrently)
        );
    }

    #[test]
    fn sequential_recall_after_completion_gets_next_called_twice() {
        let guard = NextGuard::new(false);
        assert!(guard.try_claim().is_ok());
        guard.finish();
        assert_eq!(guard.try_claim(), Err(ContractViolation::NextCalledTwice));
    }

    #[test]
    fn guard_not_called_is_not_called() {
        let guard = NextGuard::new(true);
        assert!(!guard.was_called());
    }
}
