//! Environment-driven worker settings

use crate::TaskManagerBuilder;
use crate::broker::Broker;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENV_PREFIX: &str = "DROVER_";

/// Error type for settings lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingVariable(String),

	#[error("invalid value for {key} ({value_len} bytes): {error}")]
	ParseError {
		key: String,
		value_len: usize,
		error: String,
	},
}

/// Environment variable reader with prefix support
///
/// # Examples
///
/// ```rust
/// use drover_tasks::Env;
///
/// let env = Env::from_map([("DROVER_WORKERS", "3")]);
/// assert_eq!(env.parse_with_default::<usize>("WORKERS", 4).unwrap(), 3);
/// assert_eq!(env.str_with_default("QUEUE_KEY", "q").unwrap(), "q");
/// ```
#[derive(Debug, Clone)]
pub struct Env {
	pub prefix: String,
	// Replaces the process environment when set
	vars: Option<HashMap<String, String>>,
}

impl Env {
	/// Reader over the process environment using [`DEFAULT_ENV_PREFIX`]
	pub fn new() -> Self {
		Self {
			prefix: DEFAULT_ENV_PREFIX.to_string(),
			vars: None,
		}
	}

	/// Reader over a fixed set of variables instead of the process environment
	pub fn from_map<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: Into<String>,
		V: Into<String>,
	{
		Self {
			prefix: DEFAULT_ENV_PREFIX.to_string(),
			vars: Some(
				vars.into_iter()
					.map(|(key, value)| (key.into(), value.into()))
					.collect(),
			),
		}
	}

	pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	fn key_name(&self, key: &str) -> String {
		format!("{}{}", self.prefix, key)
	}

	fn lookup(&self, full_key: &str) -> Option<String> {
		match &self.vars {
			Some(vars) => vars.get(full_key).cloned(),
			None => env::var(full_key).ok(),
		}
	}

	pub fn str(&self, key: &str) -> Result<String, ConfigError> {
		let full_key = self.key_name(key);
		self.lookup(&full_key)
			.ok_or(ConfigError::MissingVariable(full_key))
	}

	pub fn str_with_default(&self, key: &str, default: &str) -> Result<String, ConfigError> {
		Ok(self
			.lookup(&self.key_name(key))
			.unwrap_or_else(|| default.to_string()))
	}

	/// Parse a value, falling back to `default` when the variable is unset
	pub fn parse_with_default<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
	where
		T: FromStr,
		T::Err: std::fmt::Display,
	{
		let full_key = self.key_name(key);
		match self.lookup(&full_key) {
			Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::ParseError {
				key: full_key,
				value_len: value.len(),
				error: e.to_string(),
			}),
			None => Ok(default),
		}
	}
}

impl Default for Env {
	fn default() -> Self {
		Self::new()
	}
}

/// Settings for a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
	pub redis_url: String,
	pub queue_key: String,
	pub retry_key: String,
	pub workers: usize,
	pub max_retries: u32,
	pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			redis_url: "redis://127.0.0.1/".to_string(),
			queue_key: "drover:queue".to_string(),
			retry_key: "drover:retry".to_string(),
			workers: 4,
			max_retries: 3,
			shutdown_timeout: Duration::from_secs(10),
		}
	}
}

impl WorkerSettings {
	/// Read settings from `DROVER_*` variables, defaulting anything unset
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_source(&Env::new())
	}

	pub fn from_source(env: &Env) -> Result<Self, ConfigError> {
		let defaults = Self::default();
		Ok(Self {
			redis_url: env.str_with_default("REDIS_URL", &defaults.redis_url)?,
			queue_key: env.str_with_default("QUEUE_KEY", &defaults.queue_key)?,
			retry_key: env.str_with_default("RETRY_KEY", &defaults.retry_key)?,
			workers: env.parse_with_default("WORKERS", defaults.workers)?,
			max_retries: env.parse_with_default("MAX_RETRIES", defaults.max_retries)?,
			shutdown_timeout: Duration::from_secs(env.parse_with_default(
				"SHUTDOWN_TIMEOUT_SECS",
				defaults.shutdown_timeout.as_secs(),
			)?),
		})
	}

	/// Manager builder pre-filled from these settings
	pub fn builder(&self, broker: Arc<dyn Broker>) -> TaskManagerBuilder {
		TaskManagerBuilder::new()
			.broker(broker)
			.queue_key(self.queue_key.clone())
			.retry_key(self.retry_key.clone())
			.workers(self.workers)
			.max_retries(self.max_retries)
	}
}
