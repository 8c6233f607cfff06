//! # Taskmesh
//!
//! Taskmesh is the orchestration core of a multi-agent content pipeline. A
//! coordinator routes typed tasks to agent types over broker-backed queues,
//! workers run them on agents with a uniform lifecycle, every task leaves an
//! audit trace, and undeliverable tasks land in a dead-letter queue.
//!
//! ## Core Components
//!
//! - **[Coordinator]**: routing, traces, trace counters, dead-lettering
//! - **[QueueManager]**: schema-checked queues with per-message status records
//! - **[AgentRuntime]** and **[Worker]**: the agent state machine and the loop
//!   that feeds it from the `agent_task` queue
//! - **[ConfigManager]**: per-agent-type configuration with hot reload
//! - **[Broker]**: the hash, list, and pub/sub substrate (Redis with the
//!   `redis` feature, or [`InMemoryBroker`])
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskmesh::{
//!     AgentRegistry, AgentRuntime, Coordinator, EchoAgent, InMemoryBroker, QueueManager,
//!     RuntimeOptions, Task, TraceStatus, Worker, into_payload,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let queues = QueueManager::new(broker.clone());
//! let agents = Arc::new(AgentRegistry::new());
//!
//! let coordinator = Coordinator::with_agents(queues.clone(), Arc::clone(&agents)).await?;
//! let echo = AgentRuntime::start(EchoAgent, broker, RuntimeOptions::default()).await?;
//! coordinator.register_agent(Arc::new(echo));
//!
//! let task = Task::new("Echo", into_payload(serde_json::json!({"text": "hi"})));
//! coordinator.route_task(&task).await?;
//!
//! let worker = Worker::new(queues, agents).with_poll_interval(Duration::ZERO);
//! worker.run_once().await?;
//! coordinator.drain_responses(10).await?;
//!
//! let trace = coordinator.trace_for_task(task.message_id).await?.unwrap();
//! assert_eq!(trace.status, TraceStatus::Completed);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Module aliases for namespaced access
// ============================================================================

pub use taskmesh_agent as agent;
pub use taskmesh_broker as broker;
pub use taskmesh_coordinator as coordinator;
pub use taskmesh_core as core;
pub use taskmesh_queue as queue;

// ============================================================================
// Flat re-exports of the everyday API
// ============================================================================

pub use taskmesh_agent::{
    Agent, AgentConfig, AgentRegistry, AgentRuntime, AgentState, BoxError, ConfigHandle,
    ConfigManager, EchoAgent, HealthMetrics, HealthStatus, ManagedAgent, ModelAgent, ModelClient,
    RuntimeOptions, WorkOutcome, Worker,
};
#[cfg(feature = "redis")]
pub use taskmesh_broker::RedisBroker;
pub use taskmesh_broker::{Broker, BrokerConfig, InMemoryBroker};
pub use taskmesh_coordinator::{Coordinator, Trace, TraceStatistics, TraceStatus};
pub use taskmesh_core::{
    AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, AgentId, AgentType, BrokerError, DEAD_LETTER_QUEUE,
    DeadLetter, MessageId, OrchestrationError, OrchestrationResult, Payload, RequestId, Response,
    RetryPolicy, Task, TaskStatus, TraceId, into_payload,
};
pub use taskmesh_queue::{DEFAULT_JOB_TIMEOUT, QueueManager, QueueStats};
