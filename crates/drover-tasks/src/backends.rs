//! Broker implementations

pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::MemoryBroker;

#[cfg(feature = "redis-backend")]
pub use redis::RedisBroker;
