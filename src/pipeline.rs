//! Middleware chain construction and execution.
//!
//! Middleware are sorted once, at build time, by ascending priority
//! (stable for ties), then composed into a right-fold ending at the
//! terminal handler. `execute` acquires a semaphore permit before
//! running the chain and lets the returned [`crate::semaphore::PermitToken`]
//! release on drop, on every return path including unwinding.

use std::sync::Arc;

use crate::command::Command;
use crate::context::CommandContext;
use crate::error::PipelineError;
use crate::middleware::{BoxFuture, Middleware, Next, NextGuard};
use crate::semaphore::{BackPressureSemaphore, Priority};

type Handler<C> = dyn Fn(C, &CommandContext) -> BoxFuture<'static, Result<<C as Command>::Output, <C as Command>::Error>>
    + Send
    + Sync;

/// Tuning knobs for a [`Pipeline`] beyond the middleware list itself.
pub struct PipelineOptions {
    /// Priority assigned to every command's semaphore acquire.
    pub acquire_priority: Priority,
    /// Estimated queue-memory footprint charged per in-flight command.
    pub estimated_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            acquire_priority: Priority::Normal,
            estimated_size: 1024,
        }
    }
}

/// The ordered, composed middleware chain. Not constructed directly —
/// build one via [`Pipeline::build`].
pub struct Chain<C: Command> {
    middlewares: Vec<Arc<dyn Middleware<C>>>,
    handler: Box<Handler<C>>,
}

impl<C: Command> Chain<C> {
    /// Build a chain directly from its parts. Used by
    /// [`crate::parallel::ParallelExecutor`], which flattens its
    /// transforming middleware across stages into a single chain.
    pub(crate) fn new(middlewares: Vec<Arc<dyn Middleware<C>>>, handler: Box<Handler<C>>) -> Self {
        Self {
            middlewares,
            handler,
        }
    }

    /// Recursively invoke middleware starting at `index`, falling through
    /// to the handler once `index` runs past the end of the list.
    pub(crate) fn invoke<'a>(
        &'a self,
        index: usize,
        command: C,
        context: &'a CommandContext,
    ) -> BoxFuture<'a, Result<C::Output, PipelineError<C::Error>>> {
        Box::pin(async move {
            match self.middlewares.get(index) {
                Some(mw) => {
                    let guard = Arc::new(NextGuard::new(mw.may_short_circuit()));
                    let next = Next::new(guard, self, index + 1);
                    mw.execute(command, context, next).await
                }
                None => (self.handler)(command, context)
                    .await
                    .map_err(PipelineError::Handler),
            }
        })
    }
}

/// Composes a middleware chain with a bounded-concurrency gate in front
/// of it.
pub struct Pipeline<C: Command> {
    chain: Chain<C>,
    semaphore: BackPressureSemaphore,
    options: PipelineOptions,
}

impl<C: Command> Pipeline<C> {
    /// Build a pipeline. `middlewares` is sorted by ascending
    /// [`Middleware::priority`]; ties keep their relative input order
    /// (`Vec::sort_by_key` is stable).
    pub fn build(
        handler: impl Fn(C, &CommandContext) -> BoxFuture<'static, Result<C::Output, C::Error>>
            + Send
            + Sync
            + 'static,
        mut middlewares: Vec<Arc<dyn Middleware<C>>>,
        semaphore: BackPressureSemaphore,
        options: PipelineOptions,
    ) -> Self {
        middlewares.sort_by_key(|mw| mw.priority());
        Self {
            chain: Chain {
                middlewares,
                handler: Box::new(handler),
            },
            semaphore,
            options,
        }
    }

    /// Acquire a permit, then run the composed chain. The permit releases
    /// when the returned token drops, on every exit path.
    pub async fn execute(
        &self,
        command: C,
        context: &CommandContext,
    ) -> Result<C::Output, PipelineError<C::Error>> {
        let _token = self
            .semaphore
            .acquire(self.options.acquire_priority, self.options.estimated_size)
            .await?;
        self.chain.invoke(0, command, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandMetadata;
    use crate::error::ContractViolation;
    use crate::semaphore::SemaphoreConfig;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Ping;

    impl Command for Ping {
        type Output = &'static str;
        type Error = &'static str;
    }

    struct RecordOrder {
        priority: i32,
        log: Arc<parking_lot::Mutex<Vec<i32>>>,
    }

    #[async_trait]
    impl Middleware<Ping> for RecordOrder {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn execute(
            &self,
            command: Ping,
            context: &CommandContext,
            next: Next<'_, Ping>,
        ) -> Result<&'static str, PipelineError<&'static str>> {
            self.log.lock().push(self.priority);
            next.call(command, context).await
        }
    }

    struct CallTwice;

    #[async_trait]
    impl Middleware<Ping> for CallTwice {
        fn priority(&self) -> i32 {
            0
        }

        async fn execute(
            &self,
            command: Ping,
            context: &CommandContext,
            next: Next<'_, Ping>,
        ) -> Result<&'static str, PipelineError<&'static str>> {
            let cloned = next.clone();
            let _ = cloned.call(Ping, context).await;
            next.call(command, context).await
        }
    }

    fn pipeline_with(
        middlewares: Vec<Arc<dyn Middleware<Ping>>>,
    ) -> Pipeline<Ping> {
        let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(4));
        Pipeline::build(
            |_cmd, _ctx| Box::pin(async { Ok("handled") }),
            middlewares,
            semaphore,
            PipelineOptions::default(),
        )
    }

    #[compio::test]
    async fn middleware_runs_in_priority_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware<Ping>>> = vec![
            Arc::new(RecordOrder {
                priority: 300,
                log: Arc::clone(&log),
            }),
            Arc::new(RecordOrder {
                priority: 100,
                log: Arc::clone(&log),
            }),
            Arc::new(RecordOrder {
                priority: 500,
                log: Arc::clone(&log),
            }),
        ];
        let pipeline = pipeline_with(middlewares);
        let context = CommandContext::new(CommandMetadata::new(1));
        let result = pipeline.execute(Ping, &context).await;
        assert_eq!(result.unwrap(), "handled");
        assert_eq!(*log.lock(), vec![100, 300, 500]);
    }

    #[compio::test]
    async fn calling_next_twice_fails_with_contract_violation() {
        let middlewares: Vec<Arc<dyn Middleware<Ping>>> = vec![Arc::new(CallTwice)];
        let pipeline = pipeline_with(middlewares);
        let context = CommandContext::new(CommandMetadata::new(1));
        let result = pipeline.execute(Ping, &context).await;
        assert!(matches!(
            result,
            Err(PipelineError::Contract(ContractViolation::NextCalledTwice))
        ));
    }

    #[compio::test]
    async fn back_pressure_surfaces_when_semaphore_exhausted() {
        let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let _held = semaphore.try_acquire().unwrap();
        let pipeline: Pipeline<Ping> = Pipeline::build(
            |_cmd, _ctx| Box::pin(async { Ok("handled") }),
            Vec::new(),
            semaphore.clone(),
            PipelineOptions {
                acquire_priority: Priority::Normal,
                estimated_size: 1,
            },
        );
        let handle = compio::runtime::spawn(async move {
            let context = CommandContext::new(CommandMetadata::new(1));
            pipeline.execute(Ping, &context).await
        });
        compio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(_held);
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), "handled");
    }
}
