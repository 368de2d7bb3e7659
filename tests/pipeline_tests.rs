//! Integration tests covering the public pipeline and parallel-executor
//! surface end to end.

use async_trait::async_trait;
use pipelinekit::{
    concurrent_entry, sequential_entry, BackPressureSemaphore, Command, CommandContext,
    CommandMetadata, ContextKey, FailurePolicy, Middleware, Next, ParallelExecutor,
    PipelineError, PipelineOptions, SemaphoreConfig, SideEffect,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Order {
    amount: u32,
}

impl Command for Order {
    type Output = u32;
    type Error = &'static str;
}

fn discount_key() -> ContextKey<u32> {
    static KEY: std::sync::OnceLock<ContextKey<u32>> = std::sync::OnceLock::new();
    *KEY.get_or_init(|| ContextKey::new("discount"))
}

struct ApplyDiscount;

#[async_trait]
impl Middleware<Order> for ApplyDiscount {
    fn priority(&self) -> i32 {
        0
    }

    async fn execute(
        &self,
        command: Order,
        context: &CommandContext,
        next: Next<'_, Order>,
    ) -> Result<u32, PipelineError<&'static str>> {
        context.set(discount_key(), 10);
        next.call(command, context).await
    }
}

struct AuditLog {
    seen: Arc<parking_lot::Mutex<Vec<u32>>>,
}

impl SideEffect for AuditLog {}

#[async_trait]
impl Middleware<Order> for AuditLog {
    fn priority(&self) -> i32 {
        0
    }

    fn may_short_circuit(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: Order,
        _context: &CommandContext,
        _next: Next<'_, Order>,
    ) -> Result<u32, PipelineError<&'static str>> {
        self.seen.lock().push(command.amount);
        Ok(command.amount)
    }
}

#[compio::test]
async fn context_key_minted_outside_a_middleware_still_round_trips() {
    let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(4));
    let middlewares: Vec<Arc<dyn Middleware<Order>>> = vec![Arc::new(ApplyDiscount)];
    let pipeline = pipelinekit::Pipeline::build(
        |command: Order, context: &CommandContext| {
            let discount = context.get(discount_key()).unwrap_or(0);
            Box::pin(async move { Ok(command.amount.saturating_sub(discount)) })
        },
        middlewares,
        semaphore,
        PipelineOptions::default(),
    );

    let context = CommandContext::new(CommandMetadata::new(1));
    let result = pipeline.execute(Order { amount: 100 }, &context).await;
    assert_eq!(result.unwrap(), 90);
}

#[compio::test]
async fn parallel_executor_runs_side_effects_and_returns_handler_output() {
    let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(4));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = ParallelExecutor::build(
        |command: Order, _ctx| Box::pin(async move { Ok(command.amount) }),
        vec![concurrent_entry(AuditLog {
            seen: Arc::clone(&seen),
        })],
        pipelinekit::DependencyGraph::new(),
        semaphore,
        PipelineOptions::default(),
        FailurePolicy::FailFast,
    );

    let context = CommandContext::new(CommandMetadata::new(1));
    let result = executor.execute(Order { amount: 42 }, &context).await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(*seen.lock(), vec![42]);
}

#[compio::test]
async fn parallel_executor_flattens_sequential_middleware_after_side_effects() {
    let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(4));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = ParallelExecutor::build(
        |command: Order, context: &CommandContext| {
            let discount = context.get(discount_key()).unwrap_or(0);
            Box::pin(async move { Ok(command.amount.saturating_sub(discount)) })
        },
        vec![
            concurrent_entry(AuditLog {
                seen: Arc::clone(&seen),
            }),
            sequential_entry(ApplyDiscount),
        ],
        pipelinekit::DependencyGraph::new(),
        semaphore,
        PipelineOptions::default(),
        FailurePolicy::BestEffort,
    );

    let context = CommandContext::new(CommandMetadata::new(1));
    let result = executor.execute(Order { amount: 50 }, &context).await;
    assert_eq!(result.unwrap(), 40);
    assert_eq!(*seen.lock(), vec![50]);
}

#[compio::test]
async fn acquire_with_timeout_gives_up_on_a_permanently_exhausted_semaphore() {
    let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(1));
    let _held = semaphore.try_acquire().unwrap();
    let result = semaphore
        .acquire_with_timeout(Duration::from_millis(50), pipelinekit::Priority::Normal, 1)
        .await;
    assert!(result.is_err());
}
