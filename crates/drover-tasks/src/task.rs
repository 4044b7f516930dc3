//! Task definitions and wire format

use crate::{TaskError, TaskResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A unit of work exchanged through the broker.
///
/// The wire form is a JSON object with the fields `id`, `type`, `data` and
/// `retryCount`. `retryCount` is omitted while it is zero. `data` is kept as
/// raw JSON and forwarded to handlers verbatim.
///
/// Once built, only the retry counter changes, and only on the failure retry
/// path.
///
/// # Examples
///
/// ```rust
/// use drover_tasks::Task;
///
/// let task = Task::with_payload("t1", "send_email", &serde_json::json!({"to": "a@b.c"})).unwrap();
/// assert_eq!(task.id(), "t1");
/// assert_eq!(task.task_type(), "send_email");
/// assert_eq!(task.retry_count(), 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	id: String,
	#[serde(rename = "type")]
	task_type: String,
	#[serde(default)]
	data: Option<Box<RawValue>>,
	#[serde(rename = "retryCount", default, skip_serializing_if = "is_zero")]
	retry_count: u32,
}

fn is_zero(value: &u32) -> bool {
	*value == 0
}

impl Task {
	/// Create a task carrying an already-serialized payload
	///
	/// # Examples
	///
	/// ```rust
	/// use drover_tasks::Task;
	/// use serde_json::value::RawValue;
	///
	/// let data = RawValue::from_string(r#"{"n":1}"#.to_string()).unwrap();
	/// let task = Task::new("t1", "count", data);
	/// assert_eq!(task.data().map(|d| d.get()), Some(r#"{"n":1}"#));
	/// ```
	pub fn new(id: impl Into<String>, task_type: impl Into<String>, data: Box<RawValue>) -> Self {
		Self {
			id: id.into(),
			task_type: task_type.into(),
			data: Some(data),
			retry_count: 0,
		}
	}

	/// Create a task by serializing `payload` to JSON
	pub fn with_payload<T: Serialize + ?Sized>(
		id: impl Into<String>,
		task_type: impl Into<String>,
		payload: &T,
	) -> Result<Self, serde_json::Error> {
		let data = serde_json::value::to_raw_value(payload)?;
		Ok(Self::new(id, task_type, data))
	}

	/// Create a task with no payload (`"data": null` on the wire)
	pub fn without_payload(id: impl Into<String>, task_type: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			task_type: task_type.into(),
			data: None,
			retry_count: 0,
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn task_type(&self) -> &str {
		&self.task_type
	}

	/// Raw payload, exactly as it was enqueued
	pub fn data(&self) -> Option<&RawValue> {
		self.data.as_deref()
	}

	/// Number of failure retries this task has gone through
	pub fn retry_count(&self) -> u32 {
		self.retry_count
	}

	/// Decode the payload into a concrete type
	///
	/// A task without payload decodes as JSON `null`.
	///
	/// # Examples
	///
	/// ```rust
	/// use drover_tasks::Task;
	/// use serde::Deserialize;
	///
	/// #[derive(Deserialize)]
	/// struct Email { to: String }
	///
	/// let task = Task::with_payload("t1", "send_email", &serde_json::json!({"to": "a@b.c"})).unwrap();
	/// let email: Email = task.payload().unwrap();
	/// assert_eq!(email.to, "a@b.c");
	/// ```
	pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		match &self.data {
			Some(raw) => serde_json::from_str(raw.get()),
			None => serde_json::from_str("null"),
		}
	}

	/// Check the fields required before a task may be enqueued
	pub fn validate(&self) -> TaskResult<()> {
		if self.id.is_empty() {
			return Err(TaskError::InvalidTask("task id is empty".to_string()));
		}
		if self.task_type.is_empty() {
			return Err(TaskError::InvalidTask("task type is empty".to_string()));
		}
		Ok(())
	}

	/// Serialize to the wire representation
	///
	/// # Examples
	///
	/// ```rust
	/// use drover_tasks::Task;
	///
	/// let task = Task::without_payload("t1", "ping");
	/// assert_eq!(task.to_json().unwrap(), r#"{"id":"t1","type":"ping","data":null}"#);
	/// ```
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	/// Parse the wire representation
	pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(json)
	}

	/// Bump the failure retry counter and return the new value
	pub(crate) fn increment_retry(&mut self) -> u32 {
		self.retry_count = self.retry_count.saturating_add(1);
		self.retry_count
	}
}

impl PartialEq for Task {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
			&& self.task_type == other.task_type
			&& self.retry_count == other.retry_count
			&& self.data().map(RawValue::get) == other.data().map(RawValue::get)
	}
}

impl Eq for Task {}
