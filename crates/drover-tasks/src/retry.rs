//! Delayed retries
//!
//! Failed and back-pressured tasks are parked in the broker's sorted-set retry
//! index, scored by the unix time at which they become due. The retry
//! dispatcher moves due entries back onto the dispatch queue.

use crate::broker::Broker;
use crate::{Task, TaskResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Exponential backoff with full jitter
///
/// The backoff for retry count `n` is `min(cap, base * 2^n)`; the realized
/// delay is drawn uniformly from `[0, backoff)`.
///
/// # Examples
///
/// ```rust
/// use drover_tasks::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.backoff(0), Duration::from_secs(1));
/// assert_eq!(policy.backoff(3), Duration::from_secs(8));
/// assert_eq!(policy.backoff(20), Duration::from_secs(300));
///
/// let delay = policy.jittered_backoff(3);
/// assert!(delay < Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub base: Duration,
	pub cap: Duration,
}

impl RetryPolicy {
	pub fn new(base: Duration, cap: Duration) -> Self {
		Self { base, cap }
	}

	/// Upper bound of the delay before retry number `retry_count`
	pub fn backoff(&self, retry_count: u32) -> Duration {
		let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
		self.base
			.checked_mul(factor)
			.map_or(self.cap, |backoff| backoff.min(self.cap))
	}

	/// Random delay in `[0, backoff(retry_count))`
	pub fn jittered_backoff(&self, retry_count: u32) -> Duration {
		let backoff = self.backoff(retry_count);
		let upper = u64::try_from(backoff.as_nanos()).unwrap_or(u64::MAX);
		if upper == 0 {
			return Duration::ZERO;
		}
		Duration::from_nanos(rand::thread_rng().gen_range(0..upper))
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
	}
}

/// Why a task is being sent to the retry index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
	/// The handler returned an error, panicked or timed out
	Failure,
	/// No worker accepted the task in time; the retry counter is left alone
	Backpressure,
}

/// What the retrier did with a task
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
	Scheduled { retry_count: u32, due: DateTime<Utc> },
	/// The retry budget is spent; the task is gone for good
	Dropped { retry_count: u32 },
}

/// Unix time in seconds, millisecond precision, as used for retry scores
pub fn unix_score(at: DateTime<Utc>) -> f64 {
	at.timestamp_millis() as f64 / 1000.0
}

/// Parks tasks in the retry index
pub struct Retrier {
	broker: Arc<dyn Broker>,
	retry_key: String,
	max_retries: u32,
	policy: RetryPolicy,
}

impl Retrier {
	pub fn new(
		broker: Arc<dyn Broker>,
		retry_key: impl Into<String>,
		max_retries: u32,
		policy: RetryPolicy,
	) -> Self {
		Self {
			broker,
			retry_key: retry_key.into(),
			max_retries,
			policy,
		}
	}

	pub fn max_retries(&self) -> u32 {
		self.max_retries
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Schedule another attempt for `task`, or drop it once its budget is spent
	pub async fn retry(&self, mut task: Task, cause: RetryCause) -> TaskResult<RetryOutcome> {
		if cause == RetryCause::Failure {
			let retry_count = task.increment_retry();
			if retry_count > self.max_retries {
				tracing::error!(
					task_id = task.id(),
					task_type = task.task_type(),
					retry_count,
					max_retries = self.max_retries,
					"task exceeded max retries, dropping"
				);
				return Ok(RetryOutcome::Dropped { retry_count });
			}
		}

		// Back-pressured tasks keep their counter but always wait on the first tier
		let tier = match cause {
			RetryCause::Failure => task.retry_count(),
			RetryCause::Backpressure => 0,
		};
		let delay = self.policy.jittered_backoff(tier);
		let due = Utc::now()
			+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

		let payload = task.to_json()?;
		self.broker
			.sorted_set_add(&self.retry_key, unix_score(due), &payload)
			.await?;

		tracing::debug!(
			task_id = task.id(),
			task_type = task.task_type(),
			retry_count = task.retry_count(),
			?cause,
			delay_ms = delay.as_millis() as u64,
			"task scheduled for retry"
		);

		Ok(RetryOutcome::Scheduled {
			retry_count: task.retry_count(),
			due,
		})
	}
}

/// Move every due retry entry back onto the dispatch queue
///
/// Each entry is removed from the index before it is pushed, so a later tick
/// (or another process sharing the index) cannot deliver it twice. Entries
/// that fail to parse are forwarded untouched; the dispatcher discards them.
///
/// Returns the number of entries re-injected.
pub async fn promote_due(
	broker: &dyn Broker,
	retry_key: &str,
	queue_key: &str,
	now: DateTime<Utc>,
) -> usize {
	let due = match broker
		.sorted_set_range_by_score(retry_key, 0.0, unix_score(now))
		.await
	{
		Ok(due) => due,
		Err(e) => {
			tracing::warn!(error = %e, retry_key, "failed to read retry index");
			return 0;
		}
	};

	let mut promoted = 0;
	for entry in due {
		match broker.sorted_set_remove(retry_key, &entry).await {
			Ok(true) => {}
			// Claimed by someone else in the meantime
			Ok(false) => continue,
			Err(e) => {
				tracing::warn!(error = %e, retry_key, "failed to remove due retry entry");
				continue;
			}
		}

		match Task::from_json(&entry) {
			Ok(task) => tracing::debug!(
				task_id = task.id(),
				task_type = task.task_type(),
				retry_count = task.retry_count(),
				"re-injecting due task"
			),
			Err(e) => tracing::warn!(error = %e, "re-injecting unparsable retry entry"),
		}

		if let Err(e) = broker.push_tail(queue_key, &entry).await {
			tracing::error!(error = %e, queue_key, "failed to re-inject due task, entry lost");
			continue;
		}
		promoted += 1;
	}
	promoted
}

/// Retry dispatcher loop: promote due entries on every tick until cancelled
pub(crate) async fn run_retry_dispatcher(
	broker: Arc<dyn Broker>,
	retry_key: String,
	queue_key: String,
	tick: Duration,
	token: CancellationToken,
) -> TaskResult<()> {
	let mut ticker = tokio::time::interval(tick);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			biased;
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}

		let promoted = promote_due(broker.as_ref(), &retry_key, &queue_key, Utc::now()).await;
		if promoted > 0 {
			tracing::debug!(promoted, "promoted due retries");
		}
	}

	tracing::debug!("retry dispatcher stopped");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::MemoryBroker;
	use rstest::{fixture, rstest};

	const RETRY_KEY: &str = "test:retry";
	const QUEUE_KEY: &str = "test:queue";

	#[fixture]
	fn broker() -> Arc<MemoryBroker> {
		Arc::new(MemoryBroker::new())
	}

	fn retrier(broker: &Arc<MemoryBroker>, max_retries: u32) -> Retrier {
		Retrier::new(
			Arc::clone(broker) as Arc<dyn Broker>,
			RETRY_KEY,
			max_retries,
			RetryPolicy::default(),
		)
	}

	#[rstest]
	#[case(0, 1)]
	#[case(1, 2)]
	#[case(4, 16)]
	#[case(8, 256)]
	#[case(9, 300)]
	#[case(64, 300)]
	fn test_backoff_doubles_until_cap(#[case] retry_count: u32, #[case] expected_secs: u64) {
		let policy = RetryPolicy::default();

		assert_eq!(policy.backoff(retry_count), Duration::from_secs(expected_secs));
	}

	#[rstest]
	fn test_backoff_is_monotonic() {
		let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1));

		let backoffs: Vec<Duration> = (0..40).map(|n| policy.backoff(n)).collect();

		assert!(backoffs.windows(2).all(|w| w[0] <= w[1]));
		assert_eq!(*backoffs.last().unwrap(), Duration::from_secs(1));
	}

	#[rstest]
	fn test_jitter_stays_below_backoff() {
		let policy = RetryPolicy::default();

		for retry_count in 0..12 {
			for _ in 0..50 {
				let delay = policy.jittered_backoff(retry_count);
				assert!(delay < policy.backoff(retry_count));
				assert!(delay < policy.cap);
			}
		}
	}

	#[rstest]
	fn test_jitter_with_zero_base() {
		let policy = RetryPolicy::new(Duration::ZERO, Duration::from_secs(1));

		assert_eq!(policy.jittered_backoff(3), Duration::ZERO);
	}

	#[rstest]
	#[tokio::test]
	async fn test_failure_retry_increments_counter(broker: Arc<MemoryBroker>) {
		// Arrange
		let retrier = retrier(&broker, 3);
		let task = Task::without_payload("t1", "send");

		// Act
		let outcome = retrier.retry(task, RetryCause::Failure).await.unwrap();

		// Assert
		assert!(matches!(outcome, RetryOutcome::Scheduled { retry_count: 1, .. }));
		let members = broker.sorted_set_members(RETRY_KEY).await;
		assert_eq!(members.len(), 1);
		assert_eq!(Task::from_json(&members[0].0).unwrap().retry_count(), 1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_backpressure_retry_keeps_counter(broker: Arc<MemoryBroker>) {
		// Arrange
		let retrier = retrier(&broker, 3);
		let before = unix_score(Utc::now());

		// Act
		let outcome = retrier
			.retry(Task::without_payload("t1", "send"), RetryCause::Backpressure)
			.await
			.unwrap();

		// Assert - first tier only: due within one second
		assert!(matches!(outcome, RetryOutcome::Scheduled { retry_count: 0, .. }));
		let members = broker.sorted_set_members(RETRY_KEY).await;
		assert_eq!(Task::from_json(&members[0].0).unwrap().retry_count(), 0);
		assert!(members[0].1 >= before);
		assert!(members[0].1 <= before + 1.001);
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_drops_task_past_budget(broker: Arc<MemoryBroker>) {
		// Arrange
		let retrier = retrier(&broker, 2);
		let mut task = Task::without_payload("t1", "send");
		task.increment_retry();
		task.increment_retry();

		// Act
		let outcome = retrier.retry(task, RetryCause::Failure).await.unwrap();

		// Assert
		assert_eq!(outcome, RetryOutcome::Dropped { retry_count: 3 });
		assert_eq!(broker.sorted_set_len(RETRY_KEY).await, 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_reports_broker_failure(broker: Arc<MemoryBroker>) {
		let retrier = retrier(&broker, 2);
		broker.close().await.unwrap();

		let result = retrier
			.retry(Task::without_payload("t1", "send"), RetryCause::Failure)
			.await;

		assert!(result.is_err());
	}

	#[rstest]
	#[tokio::test]
	async fn test_promote_due_moves_only_due_entries(broker: Arc<MemoryBroker>) {
		// Arrange
		let now = Utc::now();
		let due = Task::without_payload("due", "send").to_json().unwrap();
		let later = Task::without_payload("later", "send").to_json().unwrap();
		broker
			.sorted_set_add(RETRY_KEY, unix_score(now) - 1.0, &due)
			.await
			.unwrap();
		broker
			.sorted_set_add(RETRY_KEY, unix_score(now) + 60.0, &later)
			.await
			.unwrap();

		// Act
		let promoted = promote_due(broker.as_ref(), RETRY_KEY, QUEUE_KEY, now).await;

		// Assert
		assert_eq!(promoted, 1);
		assert_eq!(broker.list_items(QUEUE_KEY).await, vec![due]);
		assert_eq!(broker.sorted_set_members(RETRY_KEY).await.len(), 1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_promote_due_forwards_unparsable_entries(broker: Arc<MemoryBroker>) {
		let now = Utc::now();
		broker
			.sorted_set_add(RETRY_KEY, unix_score(now) - 1.0, "not json")
			.await
			.unwrap();

		let promoted = promote_due(broker.as_ref(), RETRY_KEY, QUEUE_KEY, now).await;

		assert_eq!(promoted, 1);
		assert_eq!(broker.list_items(QUEUE_KEY).await, vec!["not json".to_string()]);
		assert_eq!(broker.sorted_set_len(RETRY_KEY).await, 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_promote_due_appends_to_tail(broker: Arc<MemoryBroker>) {
		let now = Utc::now();
		broker.push_head(QUEUE_KEY, "fresh").await.unwrap();
		broker
			.sorted_set_add(RETRY_KEY, unix_score(now) - 1.0, "retried")
			.await
			.unwrap();

		promote_due(broker.as_ref(), RETRY_KEY, QUEUE_KEY, now).await;

		assert_eq!(broker.list_items(QUEUE_KEY).await, vec!["fresh", "retried"]);
	}

	#[rstest]
	#[tokio::test]
	async fn test_retry_dispatcher_stops_on_cancel(broker: Arc<MemoryBroker>) {
		// Arrange
		let token = CancellationToken::new();
		let handle = tokio::spawn(run_retry_dispatcher(
			Arc::clone(&broker) as Arc<dyn Broker>,
			RETRY_KEY.to_string(),
			QUEUE_KEY.to_string(),
			Duration::from_millis(10),
			token.clone(),
		));
		broker
			.sorted_set_add(RETRY_KEY, unix_score(Utc::now()) - 1.0, "entry")
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;

		// Act
		token.cancel();

		// Assert
		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("retry dispatcher should stop after cancel")
			.unwrap()
			.unwrap();
		assert_eq!(broker.list_len(QUEUE_KEY).await, 1);
	}
}
