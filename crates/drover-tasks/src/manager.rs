//! Task manager
//!
//! Ties the broker, the handler registry, the dispatcher, the worker pool and
//! the retry dispatcher together behind one lifecycle: build, register
//! handlers, [`TaskManager::run`], [`TaskManager::shutdown`].

use crate::broker::Broker;
use crate::dispatcher::Dispatcher;
use crate::registry::{FnHandler, HandlerRegistry, TaskHandler};
use crate::retry::{Retrier, RetryPolicy, run_retry_dispatcher};
use crate::supervisor::Supervisor;
use crate::worker::Worker;
use crate::{HandlerError, Task, TaskError, TaskResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Fewest workers a manager runs
pub const MIN_WORKERS: usize = 2;
/// Most workers a manager runs
pub const MAX_WORKERS: usize = 5;
/// Lowest accepted retry budget
pub const MIN_RETRIES: u32 = 2;
/// Highest accepted retry budget
pub const MAX_RETRIES: u32 = 5;

/// Loop timings
///
/// The defaults match what production deployments run with; tests shrink
/// them to keep round trips short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerTimings {
	/// Longest a single blocking pop waits before re-checking for shutdown
	pub pop_timeout: Duration,
	/// Longest the dispatcher waits for a free worker before deferring a task
	pub send_timeout: Duration,
	/// Interval between scans of the retry index
	pub retry_tick: Duration,
	/// Upper bound on a single handler invocation; `None` lets handlers run
	/// for as long as they like
	pub handler_timeout: Option<Duration>,
}

impl Default for ManagerTimings {
	fn default() -> Self {
		Self {
			pop_timeout: Duration::from_secs(1),
			send_timeout: Duration::from_secs(1),
			retry_tick: Duration::from_secs(1),
			handler_timeout: None,
		}
	}
}

/// Builder for [`TaskManager`]
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{MemoryBroker, TaskManager};
/// use std::sync::Arc;
///
/// let manager = TaskManager::builder()
///     .broker(Arc::new(MemoryBroker::new()))
///     .queue_key("jobs:queue")
///     .retry_key("jobs:retry")
///     .workers(10)
///     .max_retries(1)
///     .build()
///     .unwrap();
///
/// assert_eq!(manager.workers(), 5);
/// assert_eq!(manager.max_retries(), 2);
/// ```
pub struct TaskManagerBuilder {
	broker: Option<Arc<dyn Broker>>,
	queue_key: String,
	retry_key: String,
	workers: usize,
	max_retries: u32,
	retry_policy: RetryPolicy,
	timings: ManagerTimings,
}

impl TaskManagerBuilder {
	pub fn new() -> Self {
		Self {
			broker: None,
			queue_key: String::new(),
			retry_key: String::new(),
			workers: MIN_WORKERS,
			max_retries: MIN_RETRIES,
			retry_policy: RetryPolicy::default(),
			timings: ManagerTimings::default(),
		}
	}

	pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
		self.broker = Some(broker);
		self
	}

	pub fn queue_key(mut self, key: impl Into<String>) -> Self {
		self.queue_key = key.into();
		self
	}

	pub fn retry_key(mut self, key: impl Into<String>) -> Self {
		self.retry_key = key.into();
		self
	}

	/// Worker count, clamped into `[MIN_WORKERS, MAX_WORKERS]` on build
	pub fn workers(mut self, workers: usize) -> Self {
		self.workers = workers;
		self
	}

	/// Retry budget, clamped into `[MIN_RETRIES, MAX_RETRIES]` on build
	pub fn max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;
		self
	}

	pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.retry_policy = policy;
		self
	}

	pub fn timings(mut self, timings: ManagerTimings) -> Self {
		self.timings = timings;
		self
	}

	pub fn build(self) -> TaskResult<TaskManager> {
		let broker = self
			.broker
			.ok_or_else(|| TaskError::Configuration("broker is required".to_string()))?;
		if self.queue_key.is_empty() {
			return Err(TaskError::Configuration("queue key must not be empty".to_string()));
		}
		if self.retry_key.is_empty() {
			return Err(TaskError::Configuration("retry key must not be empty".to_string()));
		}

		let workers = self.workers.clamp(MIN_WORKERS, MAX_WORKERS);
		let max_retries = self.max_retries.clamp(MIN_RETRIES, MAX_RETRIES);
		if workers != self.workers || max_retries != self.max_retries {
			tracing::debug!(
				requested_workers = self.workers,
				workers,
				requested_max_retries = self.max_retries,
				max_retries,
				"clamped task manager limits"
			);
		}

		let retrier = Arc::new(Retrier::new(
			Arc::clone(&broker),
			self.retry_key.clone(),
			max_retries,
			self.retry_policy,
		));
		let (sender, receiver) = mpsc::channel(workers);

		Ok(TaskManager {
			broker,
			registry: Arc::new(HandlerRegistry::new()),
			retrier,
			queue_key: self.queue_key,
			retry_key: self.retry_key,
			workers,
			timings: self.timings,
			supervisor: Supervisor::new(),
			sender: Mutex::new(Some(sender)),
			receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
			running: AtomicBool::new(false),
			broker_closed: AtomicBool::new(false),
		})
	}
}

impl Default for TaskManagerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Durable background task manager
///
/// Fresh tasks are pushed onto the head of the broker queue. While
/// [`run`](Self::run) is active, a dispatcher pops them and hands them to a
/// bounded pool of workers; failed tasks are parked in the retry index with
/// exponential, jittered backoff until their retry budget is spent.
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{HandlerError, MemoryBroker, Task, TaskManager};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = Arc::new(TaskManager::new(
///     Arc::new(MemoryBroker::new()),
///     "jobs:queue",
///     "jobs:retry",
///     4,
///     3,
/// )?);
///
/// manager.handle_fn("send_email", |task: Task| async move {
///     let to: String = task.payload()?;
///     println!("sending to {}", to);
///     Ok::<(), HandlerError>(())
/// });
///
/// let runner = tokio::spawn({
///     let manager = Arc::clone(&manager);
///     async move { manager.run().await }
/// });
///
/// manager
///     .enqueue(&Task::with_payload("t1", "send_email", "a@b.c")?)
///     .await?;
///
/// manager.shutdown(Duration::from_secs(10)).await?;
/// runner.await??;
/// # Ok(())
/// # }
/// ```
pub struct TaskManager {
	broker: Arc<dyn Broker>,
	registry: Arc<HandlerRegistry>,
	retrier: Arc<Retrier>,
	queue_key: String,
	retry_key: String,
	workers: usize,
	timings: ManagerTimings,
	supervisor: Supervisor,
	// Taken exactly once, by shutdown
	sender: Mutex<Option<mpsc::Sender<Task>>>,
	receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
	running: AtomicBool,
	broker_closed: AtomicBool,
}

impl TaskManager {
	/// Create a manager with default timings and retry policy
	///
	/// `workers` and `max_retries` are clamped into their accepted ranges.
	/// Fails when either key is empty.
	pub fn new(
		broker: Arc<dyn Broker>,
		queue_key: impl Into<String>,
		retry_key: impl Into<String>,
		workers: usize,
		max_retries: u32,
	) -> TaskResult<Self> {
		Self::builder()
			.broker(broker)
			.queue_key(queue_key)
			.retry_key(retry_key)
			.workers(workers)
			.max_retries(max_retries)
			.build()
	}

	pub fn builder() -> TaskManagerBuilder {
		TaskManagerBuilder::new()
	}

	pub fn workers(&self) -> usize {
		self.workers
	}

	pub fn max_retries(&self) -> u32 {
		self.retrier.max_retries()
	}

	pub fn queue_key(&self) -> &str {
		&self.queue_key
	}

	pub fn retry_key(&self) -> &str {
		&self.retry_key
	}

	pub fn timings(&self) -> &ManagerTimings {
		&self.timings
	}

	pub fn registry(&self) -> &HandlerRegistry {
		&self.registry
	}

	/// Register the handler for `task_type`
	///
	/// # Panics
	///
	/// Panics when `task_type` is empty or already has a handler.
	pub fn handle(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
		self.registry.register(task_type, handler);
	}

	/// Register an async closure as the handler for `task_type`
	///
	/// # Panics
	///
	/// Panics when `task_type` is empty or already has a handler.
	pub fn handle_fn<F, Fut>(&self, task_type: impl Into<String>, func: F)
	where
		F: Fn(Task) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
	{
		self.registry.register(task_type, Arc::new(FnHandler::new(func)));
	}

	/// Push a fresh task onto the head of the queue
	///
	/// Invalid tasks are rejected before the broker is touched.
	pub async fn enqueue(&self, task: &Task) -> TaskResult<()> {
		task.validate()?;
		let payload = task.to_json()?;

		self.broker
			.push_head(&self.queue_key, &payload)
			.await
			.map_err(TaskError::EnqueueFailed)?;

		tracing::debug!(
			task_id = task.id(),
			task_type = task.task_type(),
			queue_key = %self.queue_key,
			"task enqueued"
		);
		Ok(())
	}

	/// Run the dispatcher, the workers and the retry dispatcher
	///
	/// Blocks until [`shutdown`](Self::shutdown) is called or one of the loops
	/// fails; the first loop failure is returned.
	pub async fn run(&self) -> TaskResult<()> {
		if self.supervisor.is_cancelled() {
			return Err(TaskError::Closed);
		}
		if self.running.swap(true, Ordering::AcqRel) {
			return Err(TaskError::AlreadyRunning);
		}
		// The dispatcher owns the only sender from here on; the channel closes
		// when it stops, after any task it still held has been parked
		let Some(sender) = self.sender.lock().take() else {
			self.running.store(false, Ordering::Release);
			return Err(TaskError::Closed);
		};

		tracing::info!(
			workers = self.workers,
			max_retries = self.max_retries(),
			backend = self.broker.backend_name(),
			queue_key = %self.queue_key,
			retry_key = %self.retry_key,
			"task manager started"
		);

		let token = self.supervisor.token();
		let mut loops = Vec::with_capacity(self.workers + 2);

		for id in 0..self.workers {
			let worker = Worker {
				id,
				registry: Arc::clone(&self.registry),
				retrier: Arc::clone(&self.retrier),
				handler_timeout: self.timings.handler_timeout,
			};
			loops.push(self.supervisor.spawn(
				format!("worker-{}", id),
				worker.run(Arc::clone(&self.receiver), token.clone()),
			));
		}

		let dispatcher = Dispatcher {
			broker: Arc::clone(&self.broker),
			retrier: Arc::clone(&self.retrier),
			queue_key: self.queue_key.clone(),
			pop_timeout: self.timings.pop_timeout,
			send_timeout: self.timings.send_timeout,
		};
		loops.push(
			self.supervisor
				.spawn("dispatcher", dispatcher.run(sender, token.clone())),
		);

		loops.push(self.supervisor.spawn(
			"retry-dispatcher",
			run_retry_dispatcher(
				Arc::clone(&self.broker),
				self.retry_key.clone(),
				self.queue_key.clone(),
				self.timings.retry_tick,
				token,
			),
		));

		let result = self.supervisor.join(loops).await;
		self.running.store(false, Ordering::Release);
		tracing::info!("task manager stopped");
		result
	}

	/// Stop all loops and release the broker
	///
	/// Cancels the loops, closes the dispatch channel (directly when `run` never
	/// started, otherwise through the dispatcher stopping) and waits up to
	/// `deadline` for every loop to return. The broker is closed only after a
	/// clean drain; on timeout it stays open and
	/// [`TaskError::ShutdownTimeout`] is returned. Safe to call more than once.
	pub async fn shutdown(&self, deadline: Duration) -> TaskResult<()> {
		tracing::info!(deadline_ms = deadline.as_millis() as u64, "shutting down task manager");
		self.supervisor.cancel();

		let sender = self.sender.lock().take();
		if sender.is_some() {
			tracing::debug!("dispatch channel closed");
		}
		drop(sender);

		if let Err(e) = self.supervisor.shutdown(deadline).await {
			tracing::warn!(error = %e, "loops did not drain in time, leaving broker open");
			return Err(e);
		}

		if !self.broker_closed.swap(true, Ordering::AcqRel) {
			self.broker.close().await?;
			tracing::debug!(backend = self.broker.backend_name(), "broker closed");
		}
		Ok(())
	}
}
