//! Periodic task scheduling
//!
//! Runs in-process jobs on fixed intervals. Periodic jobs are not queued
//! through the broker and are never retried; a failed run is logged and the
//! next tick tries again.

use crate::supervisor::{Supervisor, panic_message};
use crate::{HandlerError, RegistryError, TaskError, TaskResult};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Job run on every tick of a periodic schedule
#[async_trait]
pub trait PeriodicHandler: Send + Sync {
	async fn run(&self) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`PeriodicHandler`]
pub struct FnPeriodic<F> {
	func: F,
}

impl<F, Fut> FnPeriodic<F>
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), HandlerError>> + Send,
{
	pub fn new(func: F) -> Self {
		Self { func }
	}
}

#[async_trait]
impl<F, Fut> PeriodicHandler for FnPeriodic<F>
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), HandlerError>> + Send,
{
	async fn run(&self) -> Result<(), HandlerError> {
		(self.func)().await
	}
}

#[derive(Clone)]
struct PeriodicEntry {
	task_type: String,
	interval: Duration,
	handler: Arc<dyn PeriodicHandler>,
}

/// Fixed-interval scheduler for in-process jobs
///
/// # Examples
///
/// ```rust,no_run
/// use drover_tasks::{HandlerError, PeriodicRunner};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> drover_tasks::TaskResult<()> {
/// let runner = PeriodicRunner::new();
/// runner.register_fn("heartbeat", Duration::from_secs(30), || async {
///     println!("still alive");
///     Ok::<(), HandlerError>(())
/// });
///
/// runner.start()?;
/// // ...
/// runner.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct PeriodicRunner {
	entries: RwLock<Vec<PeriodicEntry>>,
	supervisor: Supervisor,
	started: AtomicBool,
}

impl PeriodicRunner {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(Vec::new()),
			supervisor: Supervisor::new(),
			started: AtomicBool::new(false),
		}
	}

	/// Register a job, rejecting empty names, zero intervals and duplicates
	pub fn try_register(
		&self,
		task_type: impl Into<String>,
		interval: Duration,
		handler: Arc<dyn PeriodicHandler>,
	) -> Result<(), RegistryError> {
		let task_type = task_type.into();
		if task_type.is_empty() {
			return Err(RegistryError::EmptyTaskType);
		}
		if interval.is_zero() {
			return Err(RegistryError::InvalidInterval(task_type));
		}

		let mut entries = self.entries.write();
		if entries.iter().any(|entry| entry.task_type == task_type) {
			return Err(RegistryError::AlreadyRegistered(task_type));
		}
		entries.push(PeriodicEntry {
			task_type,
			interval,
			handler,
		});
		Ok(())
	}

	/// Register a job
	///
	/// Jobs registered after [`start`](Self::start) are not scheduled.
	///
	/// # Panics
	///
	/// Panics when `task_type` is empty or already registered, or when
	/// `interval` is zero.
	pub fn register(
		&self,
		task_type: impl Into<String>,
		interval: Duration,
		handler: Arc<dyn PeriodicHandler>,
	) {
		if let Err(e) = self.try_register(task_type, interval, handler) {
			panic!("invalid periodic registration: {}", e);
		}
	}

	/// Register an async closure as a job
	///
	/// # Panics
	///
	/// Same conditions as [`register`](Self::register).
	pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, interval: Duration, func: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
	{
		self.register(task_type, interval, Arc::new(FnPeriodic::new(func)));
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	/// Spawn one ticker per registered job
	///
	/// Must be called from within a Tokio runtime. Each job first runs one
	/// interval after start.
	pub fn start(&self) -> TaskResult<()> {
		if self.supervisor.is_cancelled() {
			return Err(TaskError::Closed);
		}
		if self.started.swap(true, Ordering::AcqRel) {
			return Err(TaskError::AlreadyRunning);
		}

		let entries = self.entries.read().clone();
		tracing::info!(jobs = entries.len(), "periodic runner started");
		for entry in entries {
			let name = format!("periodic-{}", entry.task_type);
			// Tickers never fail; the tracker alone is enough to wait on them
			let _ = self.supervisor.spawn(name, tick(entry, self.supervisor.token()));
		}
		Ok(())
	}

	/// Cancel every ticker and wait for in-flight runs to finish
	pub async fn stop(&self) {
		if self.supervisor.shutdown(Duration::MAX).await.is_err() {
			tracing::warn!("periodic runner did not stop cleanly");
		}
		tracing::info!("periodic runner stopped");
	}
}

impl Default for PeriodicRunner {
	fn default() -> Self {
		Self::new()
	}
}

async fn tick(entry: PeriodicEntry, token: CancellationToken) -> TaskResult<()> {
	let mut ticker = tokio::time::interval_at(Instant::now() + entry.interval, entry.interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			biased;
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}

		match AssertUnwindSafe(entry.handler.run()).catch_unwind().await {
			Ok(Ok(())) => tracing::trace!(task_type = %entry.task_type, "periodic job ran"),
			Ok(Err(e)) => {
				tracing::warn!(task_type = %entry.task_type, error = %e, "periodic job failed")
			}
			Err(payload) => tracing::error!(
				task_type = %entry.task_type,
				panic = %panic_message(payload.as_ref()),
				"periodic job panicked"
			),
		}
	}

	Ok(())
}
