//! # Taskmesh Broker
//!
//! The shared substrate every taskmesh process coordinates through: atomic
//! hash fields, FIFO lists with blocking pop, and publish/subscribe channels.
//!
//! ## Backends
//!
//! - [`InMemoryBroker`]: process-local, with fault injection for tests
//! - `RedisBroker` (feature `redis`): pooled Redis connections
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskmesh_broker::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     # #[cfg(feature = "redis")]
//!     # {
//!     let config = BrokerConfig::from_env()?;
//!     let broker = taskmesh_broker::RedisBroker::with_config(config).await?;
//!     broker.hincr("message_trace", "total_messages", 1).await?;
//!     # }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use broker::{Broker, PayloadStream};
pub use config::{BrokerConfig, ConfigError};
pub use memory::InMemoryBroker;

#[cfg(feature = "redis")]
pub use redis::RedisBroker;
