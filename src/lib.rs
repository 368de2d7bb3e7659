//! Command-processing pipeline primitives: a bounded-concurrency,
//! priority-aware back-pressure gate, a middleware chain executor, and a
//! dependency-aware parallel executor, built on the [compio] async
//! runtime.
//!
//! - [`BackPressureSemaphore`] bounds concurrency and queue depth, with
//!   priority-ordered waiters, cancellation, overflow strategies, waiter
//!   timeouts and a background cleanup sweep.
//! - [`Pipeline`] composes [`Middleware`] into a priority-ordered chain
//!   ending at a handler, gated by a [`BackPressureSemaphore`].
//! - [`ParallelExecutor`] additionally partitions middleware into
//!   dependency-respecting stages, running side-effect middleware within
//!   a stage concurrently.
//! - [`CommandContext`] is the type-keyed store middleware use to pass
//!   data to each other and to the handler.
//!
//! [compio]: https://github.com/compio-rs/compio
//!
//! # Example
//!
//! ```rust,no_run
//! use pipelinekit::{BackPressureSemaphore, Command, CommandContext, CommandMetadata};
//! use pipelinekit::{Pipeline, PipelineOptions, SemaphoreConfig};
//!
//! #[derive(Debug)]
//! struct Ping;
//!
//! impl Command for Ping {
//!     type Output = &'static str;
//!     type Error = &'static str;
//! }
//!
//! #[compio::main]
//! async fn main() {
//!     let semaphore = BackPressureSemaphore::new(SemaphoreConfig::new(64));
//!     let pipeline = Pipeline::build(
//!         |_cmd, _ctx| Box::pin(async { Ok("pong") }),
//!         Vec::new(),
//!         semaphore,
//!         PipelineOptions::default(),
//!     );
//!     let context = CommandContext::new(CommandMetadata::new(1));
//!     let result = pipeline.execute(Ping, &context).await;
//!     assert_eq!(result.unwrap(), "pong");
//! }
//! ```

mod command;
mod condvar;
mod context;
mod error;
mod heap;
mod middleware;
mod parallel;
mod pipeline;
mod semaphore;

pub use command::{Command, CommandMetadata, IdSource};
pub use context::{CommandContext, ContextKey, ContextSnapshot};
pub use error::{BackPressureError, ContractViolation, PipelineError};
pub use middleware::{BoxFuture, Middleware, Next, NextGuard, SideEffect};
pub use parallel::{
    concurrent_entry, sequential_entry, DependencyGraph, FailurePolicy, ParallelExecutor,
    StageEntry,
};
pub use pipeline::{Chain, Pipeline, PipelineOptions};
pub use semaphore::{
    BackPressureSemaphore, Health, OverflowStrategy, PermitToken, Priority, SemaphoreConfig, Stats,
};
