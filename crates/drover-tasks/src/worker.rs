//! Worker pool
//!
//! Workers share one receiving end of the dispatch channel. Each task runs
//! under panic capture; failures of any kind go back through the retrier.

use crate::registry::{HandlerRegistry, TaskHandler};
use crate::retry::{RetryCause, Retrier};
use crate::supervisor::panic_message;
use crate::{HandlerError, Task, TaskResult};
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Why a handler invocation did not succeed
#[derive(Debug, Error)]
pub(crate) enum InvocationError {
	#[error("handler failed: {0}")]
	Failed(HandlerError),

	#[error("handler panicked: {0}")]
	Panicked(String),

	#[error("handler timed out after {0:?}")]
	TimedOut(Duration),
}

/// Run `handler` on `task`, turning panics and overruns into errors
pub(crate) async fn invoke(
	handler: &dyn TaskHandler,
	task: &Task,
	limit: Option<Duration>,
) -> Result<(), InvocationError> {
	let call = AssertUnwindSafe(handler.handle(task)).catch_unwind();
	let outcome = match limit {
		Some(limit) => tokio::time::timeout(limit, call)
			.await
			.map_err(|_| InvocationError::TimedOut(limit))?,
		None => call.await,
	};

	match outcome {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => Err(InvocationError::Failed(e)),
		Err(payload) => {
			let message = panic_message(payload.as_ref());
			tracing::error!(
				task_id = task.id(),
				task_type = task.task_type(),
				panic = %message,
				backtrace = %Backtrace::force_capture(),
				"recovered from handler panic"
			);
			Err(InvocationError::Panicked(message))
		}
	}
}

pub(crate) struct Worker {
	pub(crate) id: usize,
	pub(crate) registry: Arc<HandlerRegistry>,
	pub(crate) retrier: Arc<Retrier>,
	pub(crate) handler_timeout: Option<Duration>,
}

impl Worker {
	/// Process tasks until the channel closes or `token` is cancelled
	pub(crate) async fn run(
		self,
		receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
		token: CancellationToken,
	) -> TaskResult<()> {
		tracing::debug!(worker_id = self.id, "worker started");

		loop {
			let next = tokio::select! {
				biased;
				_ = token.cancelled() => {
					self.defer_buffered(&receiver).await;
					break;
				}
				next = async { receiver.lock().await.recv().await } => next,
			};

			match next {
				Some(task) => self.process(task).await,
				None => break,
			}
		}

		tracing::debug!(worker_id = self.id, "worker stopped");
		Ok(())
	}

	pub(crate) async fn process(&self, task: Task) {
		let Some(handler) = self.registry.get(task.task_type()) else {
			tracing::warn!(
				worker_id = self.id,
				task_id = task.id(),
				task_type = task.task_type(),
				"no handler registered for task type, dropping"
			);
			return;
		};

		tracing::debug!(
			worker_id = self.id,
			task_id = task.id(),
			task_type = task.task_type(),
			retry_count = task.retry_count(),
			"processing task"
		);

		let error = match invoke(handler.as_ref(), &task, self.handler_timeout).await {
			Ok(()) => {
				tracing::debug!(worker_id = self.id, task_id = task.id(), "task completed");
				return;
			}
			Err(e) => e,
		};

		tracing::warn!(
			worker_id = self.id,
			task_id = task.id(),
			task_type = task.task_type(),
			retry_count = task.retry_count(),
			error = %error,
			"task failed"
		);

		if let Err(e) = self.retrier.retry(task, RetryCause::Failure).await {
			tracing::error!(
				worker_id = self.id,
				error = %e,
				"failed to schedule retry, task lost"
			);
		}
	}

	/// Park every task still reaching the channel so shutdown does not lose them
	///
	/// Returns once the channel is closed, which happens when the dispatcher
	/// drops its sender, so a hand-over racing the cancellation is caught too.
	async fn defer_buffered(&self, receiver: &Mutex<mpsc::Receiver<Task>>) {
		let mut receiver = receiver.lock().await;
		while let Some(task) = receiver.recv().await {
			tracing::debug!(
				worker_id = self.id,
				task_id = task.id(),
				"deferring undelivered task on shutdown"
			);
			if let Err(e) = self.retrier.retry(task, RetryCause::Backpressure).await {
				tracing::error!(error = %e, "failed to defer task on shutdown, task lost");
			}
		}
	}
}
