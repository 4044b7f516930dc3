//! Queue-to-worker dispatch
//!
//! Pops serialized tasks off the broker queue and hands them to the worker
//! pool over a bounded channel. When no worker takes a task within the send
//! timeout, the task is parked in the retry index instead of blocking the
//! dispatcher. A task popped after shutdown is signalled takes the same path,
//! so nothing leaves the queue without landing in a worker or the retry index.

use crate::broker::{Broker, BrokerError};
use crate::retry::{RetryCause, Retrier};
use crate::{Task, TaskResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum HandOver<'a> {
	Reserved(mpsc::Permit<'a, Task>),
	Busy,
	Closed,
	Cancelled,
}

pub(crate) struct Dispatcher {
	pub(crate) broker: Arc<dyn Broker>,
	pub(crate) retrier: Arc<Retrier>,
	pub(crate) queue_key: String,
	pub(crate) pop_timeout: Duration,
	pub(crate) send_timeout: Duration,
}

impl Dispatcher {
	/// Run until `token` is cancelled
	///
	/// The blocking pop is never abandoned midway: a server-side pop keeps
	/// running after its future is dropped, so cancellation is only observed
	/// between pops, at most `pop_timeout` late. The sender is dropped on
	/// return, which closes the channel for the workers.
	pub(crate) async fn run(
		self,
		sender: mpsc::Sender<Task>,
		token: CancellationToken,
	) -> TaskResult<()> {
		tracing::debug!(queue_key = %self.queue_key, "dispatcher started");

		while !token.is_cancelled() {
			let popped = self
				.broker
				.blocking_pop(&self.queue_key, self.pop_timeout)
				.await;

			let payload = match popped {
				Ok(Some((_, payload))) => payload,
				Ok(None) => continue,
				Err(e) => {
					if e == BrokerError::Closed {
						tracing::warn!("broker closed underneath the dispatcher");
					} else {
						tracing::warn!(error = %e, queue_key = %self.queue_key, "blocking pop failed");
					}
					// Pause so a broken connection does not turn into a busy loop
					tokio::select! {
						biased;
						_ = token.cancelled() => break,
						_ = tokio::time::sleep(self.pop_timeout) => continue,
					}
				}
			};

			let Some(task) = decode(&payload) else {
				continue;
			};

			self.hand_over(&sender, task, &token).await;
		}

		tracing::debug!("dispatcher stopped");
		Ok(())
	}

	/// Give `task` to a worker, or park it when none takes it in time
	///
	/// Waits for channel capacity rather than sending directly, so the task is
	/// still in hand when the wait is cut short by cancellation.
	async fn hand_over(
		&self,
		sender: &mpsc::Sender<Task>,
		task: Task,
		token: &CancellationToken,
	) {
		let slot = tokio::select! {
			biased;
			_ = token.cancelled() => HandOver::Cancelled,
			reserved = tokio::time::timeout(self.send_timeout, sender.reserve()) => match reserved {
				Ok(Ok(permit)) => HandOver::Reserved(permit),
				Ok(Err(_)) => HandOver::Closed,
				Err(_) => HandOver::Busy,
			},
		};

		match slot {
			HandOver::Reserved(permit) => {
				permit.send(task);
				return;
			}
			HandOver::Busy => tracing::warn!(
				task_id = task.id(),
				task_type = task.task_type(),
				"no worker available, deferring task"
			),
			HandOver::Closed => tracing::debug!(
				task_id = task.id(),
				task_type = task.task_type(),
				"worker pool stopped, deferring task"
			),
			HandOver::Cancelled => tracing::debug!(
				task_id = task.id(),
				task_type = task.task_type(),
				"shutting down, deferring task"
			),
		}

		if let Err(e) = self.retrier.retry(task, RetryCause::Backpressure).await {
			tracing::error!(error = %e, "failed to defer task, task lost");
		}
	}
}

/// Parse a queue entry, discarding anything that can never be dispatched
fn decode(payload: &str) -> Option<Task> {
	match Task::from_json(payload) {
		Ok(task) if task.task_type().is_empty() => {
			tracing::warn!(task_id = task.id(), "discarding task without a type");
			None
		}
		Ok(task) => Some(task),
		Err(e) => {
			tracing::warn!(error = %e, "discarding malformed task");
			None
		}
	}
}
