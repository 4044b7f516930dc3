//! End-to-end task manager tests against the in-memory broker

use drover_tasks::{
	BrokerError, HandlerError, ManagerTimings, MemoryBroker, RetryPolicy, Task, TaskError,
	TaskHandler, TaskManager,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const QUEUE_KEY: &str = "it:queue";
const RETRY_KEY: &str = "it:retry";

/// Records every invocation and fails the first `failures` of them
struct FlakyHandler {
	failures: usize,
	calls: Mutex<Vec<(String, u32)>>,
}

impl FlakyHandler {
	fn new(failures: usize) -> Self {
		Self {
			failures,
			calls: Mutex::new(Vec::new()),
		}
	}

	fn calls(&self) -> Vec<(String, u32)> {
		self.calls.lock().clone()
	}
}

#[async_trait]
impl TaskHandler for FlakyHandler {
	async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
		let attempt = {
			let mut calls = self.calls.lock();
			calls.push((task.id().to_string(), task.retry_count()));
			calls.len()
		};
		if attempt <= self.failures {
			return Err(format!("attempt {} failed", attempt).into());
		}
		Ok(())
	}
}

#[fixture]
fn broker() -> Arc<MemoryBroker> {
	Arc::new(MemoryBroker::new())
}

fn fast_manager(
	broker: &Arc<MemoryBroker>,
	workers: usize,
	max_retries: u32,
) -> Arc<TaskManager> {
	Arc::new(
		TaskManager::builder()
			.broker(Arc::clone(broker) as Arc<dyn drover_tasks::Broker>)
			.queue_key(QUEUE_KEY)
			.retry_key(RETRY_KEY)
			.workers(workers)
			.max_retries(max_retries)
			.retry_policy(RetryPolicy::new(
				Duration::from_millis(10),
				Duration::from_millis(40),
			))
			.timings(ManagerTimings {
				pop_timeout: Duration::from_millis(20),
				send_timeout: Duration::from_millis(50),
				retry_tick: Duration::from_millis(10),
				handler_timeout: None,
			})
			.build()
			.unwrap(),
	)
}

fn spawn_run(manager: &Arc<TaskManager>) -> JoinHandle<Result<(), TaskError>> {
	let manager = Arc::clone(manager);
	tokio::spawn(async move { manager.run().await })
}

async fn eventually<F>(limit: Duration, condition: F)
where
	F: Fn() -> bool,
{
	let deadline = tokio::time::Instant::now() + limit;
	while !condition() {
		assert!(
			tokio::time::Instant::now() < deadline,
			"condition not met within {:?}",
			limit
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[rstest]
#[tokio::test]
async fn test_failing_task_is_retried_until_success(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = fast_manager(&broker, 2, 2);
	let handler = Arc::new(FlakyHandler::new(2));
	manager.handle("flaky", handler.clone());
	let runner = spawn_run(&manager);

	// Act
	manager
		.enqueue(&Task::with_payload("t1", "flaky", &serde_json::json!({"n": 1})).unwrap())
		.await
		.unwrap();
	eventually(Duration::from_secs(5), || handler.calls().len() == 3).await;
	tokio::time::sleep(Duration::from_millis(200)).await;

	// Assert
	assert_eq!(
		handler.calls(),
		vec![
			("t1".to_string(), 0),
			("t1".to_string(), 1),
			("t1".to_string(), 2)
		]
	);
	assert_eq!(broker.sorted_set_len(RETRY_KEY).await, 0);
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_task_is_dropped_after_max_retries(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = fast_manager(&broker, 2, 2);
	let handler = Arc::new(FlakyHandler::new(usize::MAX));
	manager.handle("doomed", handler.clone());
	let runner = spawn_run(&manager);

	// Act
	manager
		.enqueue(&Task::without_payload("t1", "doomed"))
		.await
		.unwrap();
	eventually(Duration::from_secs(5), || handler.calls().len() == 3).await;
	tokio::time::sleep(Duration::from_millis(300)).await;

	// Assert - one initial attempt plus two retries, then nothing
	let counts: Vec<u32> = handler.calls().into_iter().map(|(_, n)| n).collect();
	assert_eq!(counts, vec![0, 1, 2]);
	assert_eq!(broker.sorted_set_len(RETRY_KEY).await, 0);
	assert_eq!(broker.list_len(QUEUE_KEY).await, 0);
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_panicking_handler_does_not_kill_workers(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = fast_manager(&broker, 2, 2);
	let panics = Arc::new(AtomicUsize::new(0));
	let healthy = Arc::new(AtomicUsize::new(0));
	manager.handle_fn("panics", {
		let panics = Arc::clone(&panics);
		move |_task: Task| {
			let panics = Arc::clone(&panics);
			async move {
				panics.fetch_add(1, Ordering::SeqCst);
				if true {
					panic!("handler bug");
				}
				Ok::<(), HandlerError>(())
			}
		}
	});
	manager.handle_fn("healthy", {
		let healthy = Arc::clone(&healthy);
		move |_task: Task| {
			let healthy = Arc::clone(&healthy);
			async move {
				healthy.fetch_add(1, Ordering::SeqCst);
				Ok::<(), HandlerError>(())
			}
		}
	});
	let runner = spawn_run(&manager);

	// Act
	manager
		.enqueue(&Task::without_payload("p1", "panics"))
		.await
		.unwrap();
	eventually(Duration::from_secs(5), || panics.load(Ordering::SeqCst) == 3).await;
	for i in 0..4 {
		manager
			.enqueue(&Task::without_payload(format!("h{}", i), "healthy"))
			.await
			.unwrap();
	}

	// Assert - panics consumed the retry budget and workers kept serving
	eventually(Duration::from_secs(5), || healthy.load(Ordering::SeqCst) == 4).await;
	assert_eq!(panics.load(Ordering::SeqCst), 3);
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_backpressure_defers_without_consuming_retries(broker: Arc<MemoryBroker>) {
	// Arrange - two slow workers and a burst much larger than the pool
	let manager = fast_manager(&broker, 2, 2);
	let seen = Arc::new(Mutex::new(Vec::<(String, u32)>::new()));
	manager.handle_fn("slow", {
		let seen = Arc::clone(&seen);
		move |task: Task| {
			let seen = Arc::clone(&seen);
			async move {
				tokio::time::sleep(Duration::from_millis(60)).await;
				seen.lock().push((task.id().to_string(), task.retry_count()));
				Ok::<(), HandlerError>(())
			}
		}
	});
	let runner = spawn_run(&manager);

	// Act
	for i in 0..10 {
		manager
			.enqueue(&Task::without_payload(format!("t{}", i), "slow"))
			.await
			.unwrap();
	}

	// Assert - every task ran, none was charged a retry
	eventually(Duration::from_secs(10), || {
		let seen = seen.lock();
		(0..10).all(|i| seen.iter().any(|(id, _)| *id == format!("t{}", i)))
	})
	.await;
	assert!(seen.lock().iter().all(|(_, retry_count)| *retry_count == 0));
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_unregistered_type_is_dropped(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = fast_manager(&broker, 2, 2);
	let runner = spawn_run(&manager);

	// Act
	manager
		.enqueue(&Task::without_payload("t1", "nobody"))
		.await
		.unwrap();
	for _ in 0..500 {
		if broker.list_len(QUEUE_KEY).await == 0 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	tokio::time::sleep(Duration::from_millis(100)).await;

	// Assert
	assert_eq!(broker.list_len(QUEUE_KEY).await, 0);
	assert_eq!(broker.sorted_set_len(RETRY_KEY).await, 0);
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_shutdown_closes_broker_after_drain(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = fast_manager(&broker, 3, 3);
	let runner = spawn_run(&manager);
	tokio::time::sleep(Duration::from_millis(50)).await;

	// Act
	let started = tokio::time::Instant::now();
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	let elapsed = started.elapsed();

	// Assert
	assert!(
		elapsed < Duration::from_millis(500),
		"idle shutdown took {:?}",
		elapsed
	);
	runner.await.unwrap().unwrap();
	assert!(broker.is_closed());
	let late = manager.enqueue(&Task::without_payload("late", "any")).await;
	assert!(matches!(
		late,
		Err(TaskError::EnqueueFailed(BrokerError::Closed))
	));
	assert!(matches!(manager.run().await, Err(TaskError::Closed)));
	manager.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_handler_timeout_counts_as_failure(broker: Arc<MemoryBroker>) {
	// Arrange
	let manager = Arc::new(
		TaskManager::builder()
			.broker(Arc::clone(&broker) as Arc<dyn drover_tasks::Broker>)
			.queue_key(QUEUE_KEY)
			.retry_key(RETRY_KEY)
			.retry_policy(RetryPolicy::new(
				Duration::from_millis(10),
				Duration::from_millis(40),
			))
			.timings(ManagerTimings {
				pop_timeout: Duration::from_millis(20),
				send_timeout: Duration::from_millis(50),
				retry_tick: Duration::from_millis(10),
				handler_timeout: Some(Duration::from_millis(30)),
			})
			.build()
			.unwrap(),
	);
	let attempts = Arc::new(Mutex::new(Vec::<u32>::new()));
	manager.handle_fn("hangs", {
		let attempts = Arc::clone(&attempts);
		move |task: Task| {
			let attempts = Arc::clone(&attempts);
			async move {
				attempts.lock().push(task.retry_count());
				tokio::time::sleep(Duration::from_secs(30)).await;
				Ok::<(), HandlerError>(())
			}
		}
	});
	let runner = spawn_run(&manager);

	// Act
	manager
		.enqueue(&Task::without_payload("t1", "hangs"))
		.await
		.unwrap();
	eventually(Duration::from_secs(5), || attempts.lock().len() == 3).await;

	// Assert
	assert_eq!(*attempts.lock(), vec![0, 1, 2]);
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_shutdown_keeps_every_popped_task(broker: Arc<MemoryBroker>) {
	// Arrange - busy workers, a full channel and a dispatcher waiting to hand over
	let manager = Arc::new(
		TaskManager::builder()
			.broker(Arc::clone(&broker) as Arc<dyn drover_tasks::Broker>)
			.queue_key(QUEUE_KEY)
			.retry_key(RETRY_KEY)
			.workers(2)
			.retry_policy(RetryPolicy::new(
				Duration::from_secs(60),
				Duration::from_secs(60),
			))
			.timings(ManagerTimings {
				pop_timeout: Duration::from_millis(20),
				send_timeout: Duration::from_secs(5),
				retry_tick: Duration::from_millis(10),
				handler_timeout: None,
			})
			.build()
			.unwrap(),
	);
	let handled = Arc::new(AtomicUsize::new(0));
	manager.handle_fn("slow", {
		let handled = Arc::clone(&handled);
		move |_task: Task| {
			let handled = Arc::clone(&handled);
			async move {
				tokio::time::sleep(Duration::from_millis(300)).await;
				handled.fetch_add(1, Ordering::SeqCst);
				Ok::<(), HandlerError>(())
			}
		}
	});
	for i in 0..5 {
		manager
			.enqueue(&Task::without_payload(format!("t{}", i), "slow"))
			.await
			.unwrap();
	}
	let runner = spawn_run(&manager);
	tokio::time::sleep(Duration::from_millis(150)).await;

	// Act
	manager.shutdown(Duration::from_secs(5)).await.unwrap();
	runner.await.unwrap().unwrap();

	// Assert - each task was handled, is still queued, or is parked for retry
	let handled = handled.load(Ordering::SeqCst);
	let queued = broker.list_len(QUEUE_KEY).await;
	let parked = broker.sorted_set_len(RETRY_KEY).await;
	assert_eq!(
		handled + queued + parked,
		5,
		"handled={} queued={} parked={}",
		handled,
		queued,
		parked
	);
	assert_eq!(handled, 2);
}
