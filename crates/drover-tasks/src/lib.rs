//! # Drover Tasks
//!
//! Durable, at-least-once background task processing.
//!
//! Producers enqueue [`Task`]s into a broker-backed queue. A [`TaskManager`]
//! pops them, hands them to a bounded pool of workers and runs the handler
//! registered for each task type. Failed tasks are parked in a delayed-retry
//! index with exponential, jittered backoff until their retry budget is
//! spent.
//!
//! ## Features
//!
//! - **Brokers**: in-process [`MemoryBroker`] and, with `redis-backend`,
//!   [`RedisBroker`]
//! - **Handlers**: [`TaskHandler`] trait or async closures
//! - **Retries**: [`RetryPolicy`] with `min(cap, base * 2^n)` backoff and full jitter
//! - **Periodic jobs**: fixed-interval [`PeriodicRunner`]
//! - **Configuration**: [`WorkerSettings`] read from `DROVER_*` variables
//!
//! ## Example
//!
//! ```rust,no_run
//! use drover_tasks::{HandlerError, MemoryBroker, Task, TaskManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(TaskManager::new(
//!     Arc::new(MemoryBroker::new()),
//!     "jobs:queue",
//!     "jobs:retry",
//!     4,
//!     3,
//! )?);
//! manager.handle_fn("resize", |task: Task| async move {
//!     println!("resizing {}", task.id());
//!     Ok::<(), HandlerError>(())
//! });
//!
//! let runner = tokio::spawn({
//!     let manager = Arc::clone(&manager);
//!     async move { manager.run().await }
//! });
//!
//! manager.enqueue(&Task::with_payload("img-1", "resize", &[640, 480])?).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! manager.shutdown(Duration::from_secs(10)).await?;
//! runner.await??;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod broker;
pub mod config;
mod dispatcher;
pub mod error;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod scheduler;
mod supervisor;
pub mod task;
mod worker;

pub use backends::MemoryBroker;
#[cfg(feature = "redis-backend")]
pub use backends::RedisBroker;
pub use broker::{Broker, BrokerError, BrokerResult};
pub use config::{ConfigError, DEFAULT_ENV_PREFIX, Env, WorkerSettings};
pub use error::{HandlerError, RegistryError, TaskError, TaskResult};
pub use manager::{
	MAX_RETRIES, MAX_WORKERS, MIN_RETRIES, MIN_WORKERS, ManagerTimings, TaskManager,
	TaskManagerBuilder,
};
pub use registry::{FnHandler, HandlerRegistry, TaskHandler};
pub use retry::{RetryCause, RetryOutcome, RetryPolicy, Retrier, promote_due, unix_score};
pub use scheduler::{FnPeriodic, PeriodicHandler, PeriodicRunner};
pub use task::Task;
