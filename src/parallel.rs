//! Dependency-aware parallel middleware executor.
//!
//! Middleware declare what they depend on by type; the executor greedily
//! partitions them into stages where every pair within a stage is
//! mutually independent. Side-effect middleware (registered via
//! [`concurrent_entry`], which requires the [`SideEffect`] marker at
//! compile time rather than checking it at runtime) run concurrently
//! within their stage, each against its own forked context; transforming
//! middleware (registered via [`sequential_entry`]) are flattened across
//! stages, preserving stage and within-stage order, into a single
//! [`crate::pipeline`]-style `next`-chained sequence ending at the
//! handler.
//!
//! Flattening the transforming half into one chain (rather than a
//! sequential sub-chain per stage with side effects interleaved between
//! them) is a deliberate simplification: `Middleware::execute` takes its
//! `next` continuation by the real downstream chain, and a stage boundary
//! in the middle of that chain has nothing meaningful to hand back once a
//! side-effect stage's concurrent members don't produce a single
//! successor command. All side-effect stages run to completion first, in
//! stage order; the transforming chain then runs exactly like
//! [`crate::pipeline::Pipeline`].
//!
//! Staging assumes a dependency always points at something of equal or
//! lower priority: the partitioner never reorders entries past their
//! priority to satisfy a forward-pointing dependency.

use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::command::Command;
use crate::context::CommandContext;
use crate::error::PipelineError;
use crate::middleware::{BoxFuture, Middleware, Next, NextGuard, SideEffect};
use crate::pipeline::{Chain, PipelineOptions};
use crate::semaphore::BackPressureSemaphore;

/// What to do when a side-effect stage member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first failure observed in a concurrent stage cancels every
    /// other still-running sibling in that stage and is surfaced as
    /// [`PipelineError::StageFailed`] once the cancellations have been
    /// awaited.
    FailFast,
    /// Every sibling runs to completion regardless of failures; failures
    /// are logged via `tracing::warn!` and otherwise ignored.
    BestEffort,
}

/// One registered middleware plus the bookkeeping the executor needs:
/// its dependency-graph identity and whether it runs in the concurrent
/// (side-effect) or sequential (transforming) half of its stage.
pub struct StageEntry<C: Command> {
    key: TypeId,
    middleware: Arc<dyn Middleware<C>>,
    concurrent: bool,
}

/// Register a transforming middleware: flattened into the sequential
/// chain that runs after every side-effect stage has completed.
pub fn sequential_entry<C, M>(middleware: M) -> StageEntry<C>
where
    C: Command,
    M: Middleware<C> + 'static,
{
    StageEntry {
        key: TypeId::of::<M>(),
        middleware: Arc::new(middleware),
        concurrent: false,
    }
}

/// Register a side-effect middleware: runs concurrently with the rest of
/// its stage, each against its own forked context. Requires `M:
/// SideEffect`, resolving the side-effect classification as a
/// compile-time marker rather than a name heuristic.
pub fn concurrent_entry<C, M>(middleware: M) -> StageEntry<C>
where
    C: Command,
    M: Middleware<C> + SideEffect + 'static,
{
    StageEntry {
        key: TypeId::of::<M>(),
        middleware: Arc::new(middleware),
        concurrent: true,
    }
}

/// `key` depends on every id in its value set; the two never share a
/// stage.
pub type DependencyGraph = HashMap<TypeId, HashSet<TypeId>>;

struct Stage<C: Command> {
    concurrent: Vec<Arc<dyn Middleware<C>>>,
}

/// Dependency-aware alternative to [`crate::pipeline::Pipeline`].
pub struct ParallelExecutor<C: Command> {
    stages: Vec<Stage<C>>,
    sequential_chain: Chain<C>,
    semaphore: BackPressureSemaphore,
    options: PipelineOptions,
    policy: FailurePolicy,
}

/// Greedily assign each entry to the first stage whose members are all
/// mutually independent of it, preserving `entries`' (priority-sorted)
/// order within and across stages.
fn partition_into_stages<C: Command>(
    entries: &[StageEntry<C>],
    deps: &DependencyGraph,
) -> Vec<Vec<usize>> {
    let depends_on = |a: TypeId, b: TypeId| deps.get(&a).is_some_and(|set| set.contains(&b));
    let independent = |a: TypeId, b: TypeId| !depends_on(a, b) && !depends_on(b, a);

    let mut stages: Vec<Vec<usize>> = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let slot = stages.iter_mut().find(|stage| {
            stage
                .iter()
                .all(|&other| independent(entry.key, entries[other].key))
        });
        match slot {
            Some(stage) => stage.push(idx),
            None => stages.push(vec![idx]),
        }
    }
    stages
}

impl<C: Command + Clone> ParallelExecutor<C> {
    /// Build an executor. `entries` are sorted by ascending
    /// [`Middleware::priority`] before staging, matching
    /// [`crate::pipeline::Pipeline`]'s ordering convention.
    pub fn build(
        handler: impl Fn(C, &CommandContext) -> BoxFuture<'static, Result<C::Output, C::Error>>
            + Send
            + Sync
            + 'static,
        mut entries: Vec<StageEntry<C>>,
        dependencies: DependencyGraph,
        semaphore: BackPressureSemaphore,
        options: PipelineOptions,
        policy: FailurePolicy,
    ) -> Self {
        entries.sort_by_key(|e| e.middleware.priority());
        let stage_indices = partition_into_stages(&entries, &dependencies);

        let mut stages = Vec::with_capacity(stage_indices.len());
        let mut sequential = Vec::new();
        for indices in stage_indices {
            let mut concurrent = Vec::new();
            for idx in indices {
                let entry = &entries[idx];
                if entry.concurrent {
                    concurrent.push(Arc::clone(&entry.middleware));
                } else {
                    sequential.push(Arc::clone(&entry.middleware));
                }
            }
            stages.push(Stage { concurrent });
        }

        Self {
            stages,
            sequential_chain: Chain::new(sequential, Box::new(handler)),
            semaphore,
            options,
            policy,
        }
    }

    /// Acquire a permit, run every stage's side-effect members (stage
    /// order, concurrent within a stage), then the flattened sequential
    /// chain ending at the handler.
    pub async fn execute(
        &self,
        command: C,
        context: &CommandContext,
    ) -> Result<C::Output, PipelineError<C::Error>> {
        let _token = self
            .semaphore
            .acquire(self.options.acquire_priority, self.options.estimated_size)
            .await?;

        for stage in &self.stages {
            if !stage.concurrent.is_empty() {
                self.run_concurrent_stage(stage, &command, context).await?;
            }
        }

        self.sequential_chain.invoke(0, command, context).await
    }

    async fn run_concurrent_stage(
        &self,
        stage: &Stage<C>,
        command: &C,
        context: &CommandContext,
    ) -> Result<(), PipelineError<C::Error>> {
        let mut handles = Vec::with_capacity(stage.concurrent.len());
        for mw in &stage.concurrent {
            let mw = Arc::clone(mw);
            let command = command.clone();
            let forked = context.fork();
            handles.push(compio::runtime::spawn(async move {
                let guard = Arc::new(NextGuard::new(mw.may_short_circuit()));
                let next = Next::new_isolated(guard);
                mw.execute(command, &forked, next).await
            }));
        }

        match self.policy {
            FailurePolicy::FailFast => Self::await_fail_fast(handles).await,
            FailurePolicy::BestEffort => {
                for handle in handles {
                    match handle.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(error = %err, "side-effect middleware failed under BestEffort policy");
                        }
                        Err(_) => {
                            tracing::warn!("side-effect middleware task did not complete under BestEffort policy");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Await `handles` in completion order, picking up every result that's
    /// ready on each wake (there can be more than one). As soon as any
    /// failure shows up, every sibling still running is cancelled and
    /// awaited before this returns, so a `FailFast` stage never leaves a
    /// side effect running in the background after it has returned.
    async fn await_fail_fast(
        handles: Vec<compio::runtime::JoinHandle<Result<C::Output, PipelineError<C::Error>>>>,
    ) -> Result<(), PipelineError<C::Error>> {
        use std::future::Future;
        use std::pin::Pin;
        use std::task::Poll;

        let mut slots: Vec<Option<_>> = handles.into_iter().map(Some).collect();
        let mut failures = Vec::new();

        while slots.iter().any(Option::is_some) {
            let done: Vec<_> = std::future::poll_fn(|cx| {
                let mut done = Vec::new();
                for slot in slots.iter_mut() {
                    if let Some(handle) = slot {
                        if let Poll::Ready(result) = Pin::new(handle).poll(cx) {
                            done.push(result);
                            *slot = None;
                        }
                    }
                }
                if done.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(done)
                }
            })
            .await;

            for joined in done {
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => failures.push(err.to_string()),
                    Err(_) => failures.push("side-effect middleware task did not complete".to_string()),
                }
            }

            if !failures.is_empty() {
                break;
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        for handle in slots.into_iter().flatten() {
            handle.cancel().await;
        }
        Err(PipelineError::StageFailed(failures))
    }
}
