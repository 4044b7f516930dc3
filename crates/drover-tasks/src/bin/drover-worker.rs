//! Standalone worker process
//!
//! Reads `DROVER_*` settings, connects the broker and processes tasks until
//! Ctrl-C. Log verbosity follows `RUST_LOG`.

use anyhow::{Context, Result};
use drover_tasks::{Broker, HandlerError, PeriodicRunner, Task, TaskManager, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(feature = "redis-backend")]
async fn connect(settings: &WorkerSettings) -> Result<Arc<dyn Broker>> {
	let broker = drover_tasks::RedisBroker::new(&settings.redis_url)
		.await
		.with_context(|| format!("failed to connect to {}", settings.redis_url))?;
	tracing::info!(redis_url = %settings.redis_url, "connected to redis");
	Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect(_settings: &WorkerSettings) -> Result<Arc<dyn Broker>> {
	tracing::warn!("built without redis-backend, tasks live in process memory only");
	Ok(Arc::new(drover_tasks::MemoryBroker::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "drover_tasks=info,drover_worker=info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let settings = WorkerSettings::from_env().context("invalid worker settings")?;
	let broker = connect(&settings).await?;
	let manager = Arc::new(settings.builder(broker).build()?);

	manager.handle_fn("log", |task: Task| async move {
		let data = task.data().map(|raw| raw.get().to_string());
		tracing::info!(
			task_id = task.id(),
			retry_count = task.retry_count(),
			data = data.as_deref().unwrap_or("null"),
			"log task"
		);
		Ok::<(), HandlerError>(())
	});

	let periodic = PeriodicRunner::new();
	periodic.register_fn("heartbeat", HEARTBEAT_INTERVAL, {
		let manager = Arc::clone(&manager);
		move || {
			let manager = Arc::clone(&manager);
			async move {
				let task = Task::with_payload(
					uuid::Uuid::new_v4().to_string(),
					"log",
					&serde_json::json!({ "heartbeat": chrono::Utc::now().to_rfc3339() }),
				)?;
				manager.enqueue(&task).await?;
				Ok::<(), HandlerError>(())
			}
		}
	});

	let runner = tokio::spawn({
		let manager = Arc::clone(&manager);
		async move { manager.run().await }
	});
	periodic.start()?;

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for ctrl-c")?;
	tracing::info!("shutdown requested");

	periodic.stop().await;
	manager.shutdown(settings.shutdown_timeout).await?;
	runner.await??;

	tracing::info!("worker shutdown complete");
	Ok(())
}
