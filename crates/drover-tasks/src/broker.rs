//! Broker contract
//!
//! The broker is the durable store behind the task queue. It keeps two
//! structures per manager:
//!
//! - a list used as the dispatch queue (fresh tasks are pushed onto the head,
//!   the dispatcher pops from the tail)
//! - a sorted set used as the delayed-retry index, scored by the unix time at
//!   which the task becomes due
//!
//! Implementations must be safe to share between the dispatcher, the retry
//! dispatcher and producers.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error type for broker operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
	/// The connection was released with [`Broker::close`]
	#[error("broker connection is closed")]
	Closed,

	/// The backing store failed the command
	#[error("broker error: {0}")]
	Backend(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// List and sorted-set operations the task manager relies on
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{Broker, MemoryBroker};
/// use std::time::Duration;
///
/// # async fn example() -> drover_tasks::BrokerResult<()> {
/// let broker = MemoryBroker::new();
/// broker.push_head("queue", "first").await?;
/// broker.push_head("queue", "second").await?;
///
/// let popped = broker.blocking_pop("queue", Duration::from_millis(10)).await?;
/// assert_eq!(popped, Some(("queue".to_string(), "first".to_string())));
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Broker: Send + Sync {
	/// Push onto the head of a list
	async fn push_head(&self, key: &str, value: &str) -> BrokerResult<()>;

	/// Push onto the tail of a list
	async fn push_tail(&self, key: &str, value: &str) -> BrokerResult<()>;

	/// Pop from the tail of a list, waiting at most `timeout`
	///
	/// Returns `Ok(None)` when nothing arrived in time.
	async fn blocking_pop(
		&self,
		key: &str,
		timeout: Duration,
	) -> BrokerResult<Option<(String, String)>>;

	/// Insert `member` into a sorted set, replacing the score of an existing member
	async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> BrokerResult<()>;

	/// Members whose score lies in `[min, max]`, lowest score first
	async fn sorted_set_range_by_score(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> BrokerResult<Vec<String>>;

	/// Remove `member`, returning whether it was present
	async fn sorted_set_remove(&self, key: &str, member: &str) -> BrokerResult<bool>;

	/// Release the connection; later calls fail with [`BrokerError::Closed`]
	async fn close(&self) -> BrokerResult<()>;

	fn backend_name(&self) -> &str;
}
