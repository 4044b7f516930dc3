//! Error types

use crate::broker::BrokerError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the task manager and periodic runner
#[derive(Debug, Error)]
pub enum TaskError {
	/// Producer handed over a task that can never be dispatched
	#[error("invalid task: {0}")]
	InvalidTask(String),

	/// The broker rejected the push of a fresh task
	#[error("enqueue failed: {0}")]
	EnqueueFailed(#[source] BrokerError),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// Missing broker, empty key names and similar startup mistakes
	#[error("invalid configuration: {0}")]
	Configuration(String),

	#[error("already running")]
	AlreadyRunning,

	#[error("task manager has been shut down")]
	Closed,

	/// Not every loop drained before the shutdown deadline
	#[error("shutdown deadline of {0:?} exceeded before all loops drained")]
	ShutdownTimeout(Duration),

	/// A supervised loop panicked or returned an error
	#[error("{name} loop failed: {reason}")]
	LoopFailed { name: String, reason: String },

	#[error(transparent)]
	Broker(#[from] BrokerError),
}

/// Registration mistakes
///
/// [`crate::TaskManager::handle`] and [`crate::PeriodicRunner::register`] turn
/// these into panics; the `try_` variants hand them back instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
	#[error("task type must not be empty")]
	EmptyTaskType,

	#[error("handler for task type '{0}' is already registered")]
	AlreadyRegistered(String),

	#[error("interval for task type '{0}' must be greater than zero")]
	InvalidInterval(String),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Failure reported by a handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
