//! Handler registry for dynamic task dispatch
//!
//! Maps a task type to the handler that processes it. Each manager owns its
//! own registry; there is no process-wide table.

use crate::{HandlerError, RegistryError, Task};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Business logic run for every task of one type
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{HandlerError, Task, TaskHandler};
/// use async_trait::async_trait;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl TaskHandler for SendEmail {
///     async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
///         let to: String = task.payload()?;
///         println!("sending to {}", to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
	async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
///
/// The closure receives its own copy of the task.
pub struct FnHandler<F> {
	func: F,
}

impl<F, Fut> FnHandler<F>
where
	F: Fn(Task) -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), HandlerError>> + Send,
{
	pub fn new(func: F) -> Self {
		Self { func }
	}
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
	F: Fn(Task) -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), HandlerError>> + Send,
{
	async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
		(self.func)(task.clone()).await
	}
}

/// Registry of task handlers keyed by task type
///
/// Lookups and registrations share one lock, so handlers may still be added
/// while the manager is running.
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{FnHandler, HandlerError, HandlerRegistry, RegistryError, Task};
/// use std::sync::Arc;
///
/// let registry = HandlerRegistry::new();
/// let handler = Arc::new(FnHandler::new(|_task: Task| async { Ok::<(), HandlerError>(()) }));
///
/// registry.try_register("send", handler.clone()).unwrap();
/// assert!(registry.contains("send"));
/// assert_eq!(
///     registry.try_register("send", handler),
///     Err(RegistryError::AlreadyRegistered("send".to_string()))
/// );
/// ```
pub struct HandlerRegistry {
	handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self {
			handlers: RwLock::new(HashMap::new()),
		}
	}

	/// Register a handler, rejecting empty and duplicate task types
	pub fn try_register(
		&self,
		task_type: impl Into<String>,
		handler: Arc<dyn TaskHandler>,
	) -> Result<(), RegistryError> {
		let task_type = task_type.into();
		if task_type.is_empty() {
			return Err(RegistryError::EmptyTaskType);
		}

		let mut handlers = self.handlers.write();
		if handlers.contains_key(&task_type) {
			return Err(RegistryError::AlreadyRegistered(task_type));
		}
		handlers.insert(task_type, handler);
		Ok(())
	}

	/// Register a handler, panicking on misuse
	///
	/// Registration mistakes are programming errors; they abort startup instead
	/// of surfacing at dispatch time.
	///
	/// # Panics
	///
	/// Panics when `task_type` is empty or already has a handler.
	pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
		if let Err(e) = self.try_register(task_type, handler) {
			panic!("invalid handler registration: {}", e);
		}
	}

	pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
		self.handlers.read().get(task_type).cloned()
	}

	pub fn contains(&self, task_type: &str) -> bool {
		self.handlers.read().contains_key(task_type)
	}

	/// Registered task types in sorted order
	pub fn task_types(&self) -> Vec<String> {
		let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
		types.sort();
		types
	}

	pub fn len(&self) -> usize {
		self.handlers.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.read().is_empty()
	}
}

impl Default for HandlerRegistry {
	fn default() -> Self {
		Self::new()
	}
}
