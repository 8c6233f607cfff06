//! # Taskmesh Coordinator
//!
//! Submission side of the taskmesh orchestration core.
//!
//! - [`Coordinator`]: routes tasks to live agents of the requested type,
//!   dead-letters tasks that cannot be delivered, and closes traces from
//!   agent responses
//! - [`TraceStore`]: per-task `trace:<id>` records whose status only moves
//!   forward
//! - [`TraceCounters`]: the global `message_trace` totals
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use taskmesh_agent::{AgentRuntime, EchoAgent, RuntimeOptions};
//! use taskmesh_broker::InMemoryBroker;
//! use taskmesh_coordinator::{Coordinator, TraceStatus};
//! use taskmesh_core::{Payload, Task};
//! use taskmesh_queue::QueueManager;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let coordinator = Coordinator::new(QueueManager::new(broker.clone())).await?;
//! let echo = AgentRuntime::start(EchoAgent, broker, RuntimeOptions::default()).await?;
//! coordinator.register_agent(Arc::new(echo));
//!
//! let task = Task::new("Echo", Payload::new());
//! coordinator.route_task(&task).await?;
//!
//! let trace = coordinator.trace_for_task(task.message_id).await?.unwrap();
//! assert_eq!(trace.status, TraceStatus::Routed);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod counters;
pub mod trace;

pub use coordinator::Coordinator;
pub use counters::{Counter, TraceCounters, TraceStatistics};
pub use trace::{Trace, TraceStatus, TraceStore};
