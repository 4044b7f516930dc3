//! Structured supervision of background loops
//!
//! Every loop started by the task manager or the periodic runner runs on a
//! [`Supervisor`]: one cancellation signal shared by all loops, one tracker
//! that knows when they have all returned.

use crate::{TaskError, TaskResult};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Readable message for a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

/// A named loop spawned on a [`Supervisor`]
pub(crate) struct Supervised {
	name: String,
	handle: JoinHandle<TaskResult<()>>,
}

pub(crate) struct Supervisor {
	token: CancellationToken,
	tracker: TaskTracker,
}

impl Supervisor {
	pub(crate) fn new() -> Self {
		Self {
			token: CancellationToken::new(),
			tracker: TaskTracker::new(),
		}
	}

	/// Cancellation signal observed by every supervised loop
	pub(crate) fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub(crate) fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	pub(crate) fn cancel(&self) {
		self.token.cancel();
	}

	pub(crate) fn spawn<F>(&self, name: impl Into<String>, future: F) -> Supervised
	where
		F: Future<Output = TaskResult<()>> + Send + 'static,
	{
		let name = name.into();
		tracing::trace!(loop_name = %name, "spawning supervised loop");
		Supervised {
			name,
			handle: self.tracker.spawn(future),
		}
	}

	/// Wait for all `loops` to return
	///
	/// The first failure cancels the remaining loops and is returned once they
	/// have all stopped. Later failures are only logged.
	pub(crate) async fn join(&self, loops: Vec<Supervised>) -> TaskResult<()> {
		let mut pending: FuturesUnordered<_> = loops
			.into_iter()
			.map(|Supervised { name, handle }| async move { (name, handle.await) })
			.collect();

		let mut first_error = None;
		while let Some((name, joined)) = pending.next().await {
			let error = match joined {
				Ok(Ok(())) => continue,
				Ok(Err(e)) => TaskError::LoopFailed {
					name,
					reason: e.to_string(),
				},
				Err(e) if e.is_panic() => TaskError::LoopFailed {
					name,
					reason: format!("panicked: {}", panic_message(e.into_panic().as_ref())),
				},
				Err(e) => TaskError::LoopFailed {
					name,
					reason: e.to_string(),
				},
			};

			tracing::error!(error = %error, "supervised loop failed");
			if first_error.is_none() {
				self.token.cancel();
				first_error = Some(error);
			}
		}

		first_error.map_or(Ok(()), Err)
	}

	/// Cancel, stop accepting loops and wait for the running ones to return
	pub(crate) async fn shutdown(&self, deadline: Duration) -> TaskResult<()> {
		self.token.cancel();
		self.tracker.close();
		tokio::time::timeout(deadline, self.tracker.wait())
			.await
			.map_err(|_| TaskError::ShutdownTimeout(deadline))
	}
}

impl Default for Supervisor {
	fn default() -> Self {
		Self::new()
	}
}
