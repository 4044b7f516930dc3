//! In-process broker
//!
//! Mirrors the list and sorted-set semantics of Redis closely enough to run the
//! task manager inside a single process. Nothing is persisted.

use crate::broker::{Broker, BrokerError, BrokerResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct MemoryState {
	lists: HashMap<String, VecDeque<String>>,
	sorted_sets: HashMap<String, HashMap<String, f64>>,
}

/// In-memory broker for tests and single-process deployments
///
/// # Examples
///
/// ```rust
/// use drover_tasks::{Broker, MemoryBroker};
///
/// # async fn example() -> drover_tasks::BrokerResult<()> {
/// let broker = MemoryBroker::new();
/// broker.sorted_set_add("retry", 10.0, "a").await?;
/// broker.sorted_set_add("retry", 20.0, "b").await?;
///
/// let due = broker.sorted_set_range_by_score("retry", f64::NEG_INFINITY, 15.0).await?;
/// assert_eq!(due, vec!["a".to_string()]);
/// # Ok(())
/// # }
/// ```
pub struct MemoryBroker {
	state: Mutex<MemoryState>,
	// Woken on every list push and on close
	pushed: Notify,
	closed: AtomicBool,
}

impl MemoryBroker {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(MemoryState::default()),
			pushed: Notify::new(),
			closed: AtomicBool::new(false),
		}
	}

	fn ensure_open(&self) -> BrokerResult<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(BrokerError::Closed);
		}
		Ok(())
	}

	/// Whether [`Broker::close`] has been called
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Number of entries in a list
	pub async fn list_len(&self, key: &str) -> usize {
		let state = self.state.lock().await;
		state.lists.get(key).map(VecDeque::len).unwrap_or(0)
	}

	/// Snapshot of a list, head first
	pub async fn list_items(&self, key: &str) -> Vec<String> {
		let state = self.state.lock().await;
		state
			.lists
			.get(key)
			.map(|list| list.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Number of members in a sorted set
	pub async fn sorted_set_len(&self, key: &str) -> usize {
		let state = self.state.lock().await;
		state.sorted_sets.get(key).map(HashMap::len).unwrap_or(0)
	}

	/// Snapshot of a sorted set as `(member, score)`, lowest score first
	pub async fn sorted_set_members(&self, key: &str) -> Vec<(String, f64)> {
		let state = self.state.lock().await;
		let mut members: Vec<(String, f64)> = state
			.sorted_sets
			.get(key)
			.map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
			.unwrap_or_default();
		members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
		members
	}

	async fn push(&self, key: &str, value: &str, at_head: bool) -> BrokerResult<()> {
		self.ensure_open()?;
		{
			let mut state = self.state.lock().await;
			let list = state.lists.entry(key.to_string()).or_default();
			if at_head {
				list.push_front(value.to_string());
			} else {
				list.push_back(value.to_string());
			}
		}
		self.pushed.notify_waiters();
		Ok(())
	}
}

impl Default for MemoryBroker {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Broker for MemoryBroker {
	async fn push_head(&self, key: &str, value: &str) -> BrokerResult<()> {
		self.push(key, value, true).await
	}

	async fn push_tail(&self, key: &str, value: &str) -> BrokerResult<()> {
		self.push(key, value, false).await
	}

	async fn blocking_pop(
		&self,
		key: &str,
		timeout: Duration,
	) -> BrokerResult<Option<(String, String)>> {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			// Register interest before looking at the list so a push between the
			// check and the wait is not missed.
			let notified = self.pushed.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			self.ensure_open()?;
			{
				let mut state = self.state.lock().await;
				if let Some(value) = state.lists.get_mut(key).and_then(VecDeque::pop_back) {
					return Ok(Some((key.to_string(), value)));
				}
			}

			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return Ok(None);
			}
		}
	}

	async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> BrokerResult<()> {
		self.ensure_open()?;
		let mut state = self.state.lock().await;
		state
			.sorted_sets
			.entry(key.to_string())
			.or_default()
			.insert(member.to_string(), score);
		Ok(())
	}

	async fn sorted_set_range_by_score(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> BrokerResult<Vec<String>> {
		self.ensure_open()?;
		let state = self.state.lock().await;
		let Some(set) = state.sorted_sets.get(key) else {
			return Ok(Vec::new());
		};

		let mut due: Vec<(&String, f64)> = set
			.iter()
			.filter(|(_, score)| **score >= min && **score <= max)
			.map(|(member, score)| (member, *score))
			.collect();
		due.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

		Ok(due.into_iter().map(|(member, _)| member.clone()).collect())
	}

	async fn sorted_set_remove(&self, key: &str, member: &str) -> BrokerResult<bool> {
		self.ensure_open()?;
		let mut state = self.state.lock().await;
		Ok(state
			.sorted_sets
			.get_mut(key)
			.map(|set| set.remove(member).is_some())
			.unwrap_or(false))
	}

	async fn close(&self) -> BrokerResult<()> {
		self.closed.store(true, Ordering::Release);
		self.pushed.notify_waiters();
		Ok(())
	}

	fn backend_name(&self) -> &str {
		"memory"
	}
}
