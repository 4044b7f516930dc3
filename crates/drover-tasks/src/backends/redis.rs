//! Redis-based broker implementation

use crate::broker::{Broker, BrokerError, BrokerResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{AsyncCommands, RedisError, aio::ConnectionManager};
use std::time::Duration;

fn backend_error(e: RedisError) -> BrokerError {
	BrokerError::Backend(e.to_string())
}

/// Redis-based broker
///
/// Lists map onto LPUSH/RPUSH/BRPOP and the retry index onto a sorted set.
/// Blocking pops are issued on their own connection so a BRPOP that is
/// waiting for work never holds up pushes or sorted-set commands sharing the
/// multiplexed connection.
///
/// # Examples
///
/// ```no_run
/// use drover_tasks::RedisBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedisBroker::new("redis://127.0.0.1/").await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisBroker {
	connection: RwLock<Option<ConnectionManager>>,
	blocking: RwLock<Option<ConnectionManager>>,
}

impl RedisBroker {
	/// Connect to Redis
	///
	/// # Arguments
	///
	/// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1/")
	pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
		let client = redis::Client::open(redis_url)?;
		let connection = ConnectionManager::new(client.clone()).await?;
		let blocking = ConnectionManager::new(client).await?;

		Ok(Self {
			connection: RwLock::new(Some(connection)),
			blocking: RwLock::new(Some(blocking)),
		})
	}

	fn connection(&self) -> BrokerResult<ConnectionManager> {
		self.connection.read().clone().ok_or(BrokerError::Closed)
	}

	fn blocking_connection(&self) -> BrokerResult<ConnectionManager> {
		self.blocking.read().clone().ok_or(BrokerError::Closed)
	}
}

#[async_trait]
impl Broker for RedisBroker {
	async fn push_head(&self, key: &str, value: &str) -> BrokerResult<()> {
		let mut conn = self.connection()?;
		let _: i64 = conn.lpush(key, value).await.map_err(backend_error)?;
		Ok(())
	}

	async fn push_tail(&self, key: &str, value: &str) -> BrokerResult<()> {
		let mut conn = self.connection()?;
		let _: i64 = conn.rpush(key, value).await.map_err(backend_error)?;
		Ok(())
	}

	async fn blocking_pop(
		&self,
		key: &str,
		timeout: Duration,
	) -> BrokerResult<Option<(String, String)>> {
		let mut conn = self.blocking_connection()?;
		// BRPOP replies nil on timeout
		conn.brpop(key, timeout.as_secs_f64())
			.await
			.map_err(backend_error)
	}

	async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> BrokerResult<()> {
		let mut conn = self.connection()?;
		let _: i64 = conn.zadd(key, member, score).await.map_err(backend_error)?;
		Ok(())
	}

	async fn sorted_set_range_by_score(
		&self,
		key: &str,
		min: f64,
		max: f64,
	) -> BrokerResult<Vec<String>> {
		let mut conn = self.connection()?;
		conn.zrangebyscore(key, min, max)
			.await
			.map_err(backend_error)
	}

	async fn sorted_set_remove(&self, key: &str, member: &str) -> BrokerResult<bool> {
		let mut conn = self.connection()?;
		let removed: i64 = conn.zrem(key, member).await.map_err(backend_error)?;
		Ok(removed > 0)
	}

	async fn close(&self) -> BrokerResult<()> {
		// Dropping the managers tears the connections down
		self.connection.write().take();
		self.blocking.write().take();
		Ok(())
	}

	fn backend_name(&self) -> &str {
		"redis"
	}
}
