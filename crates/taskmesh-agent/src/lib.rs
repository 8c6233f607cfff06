//! # Taskmesh Agent
//!
//! Everything that runs on the worker side of the taskmesh orchestration core.
//!
//! - [`AgentRuntime`]: hosts an [`Agent`] behind the uniform
//!   idle → processing → idle/error lifecycle, with health metrics and state
//!   persisted to the broker on every transition
//! - [`AgentRegistry`]: the agents a process serves, selected round-robin by
//!   type
//! - [`Worker`]: pulls tasks from the `agent_task` queue and answers on
//!   `agent_response`
//! - [`ConfigManager`]: per-agent-type configuration with a broker cache, a
//!   YAML file store, and change notification for hot reload
//! - [`ModelClient`]: the single collaborator interface for model invocation
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use taskmesh_agent::{AgentRuntime, EchoAgent, ManagedAgent, RuntimeOptions};
//! use taskmesh_broker::InMemoryBroker;
//! use taskmesh_core::{Payload, Task};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let runtime = AgentRuntime::start(EchoAgent, broker, RuntimeOptions::default()).await?;
//!
//! let response = runtime.handle_task(&Task::new("Echo", Payload::new())).await?;
//! assert!(response.is_success());
//! assert_eq!(runtime.get_health_status().health_metrics.tasks_processed, 1);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod model;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod worker;

pub use agent::{Agent, BoxError, EchoAgent};
pub use config::{AgentConfig, ConfigChange, ConfigChangeStream, ConfigManager, LogLevel};
pub use model::{ChatMessage, ModelAgent, ModelClient, Role};
pub use registry::AgentRegistry;
pub use runtime::{AgentRuntime, ConfigHandle, HealthStatus, ManagedAgent, RuntimeOptions};
pub use state::{AgentState, HealthMetrics};
pub use worker::{DEFAULT_POLL_INTERVAL, WorkOutcome, Worker};
