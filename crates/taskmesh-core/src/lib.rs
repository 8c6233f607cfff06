//! # Taskmesh Core
//!
//! Shared vocabulary of the taskmesh orchestration core: the task, response,
//! and dead-letter messages that travel through typed queues, the enumerated
//! agent types, identifier newtypes, broker key shapes, the error taxonomy, and
//! the bounded retry policy applied to broker calls.

pub mod agent_type;
pub mod error;
pub mod ids;
pub mod keys;
pub mod payload;
pub mod retry;
pub mod task;

pub use agent_type::{AgentType, UnknownAgentType};
pub use error::{BrokerError, BrokerResult, OrchestrationError, OrchestrationResult, Transient};
pub use ids::{AgentId, IdValidationError, MessageId, RequestId, TraceId};
pub use payload::{
    AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, DEAD_LETTER_QUEUE, PayloadSchema, QueuePayload,
};
pub use retry::RetryPolicy;
pub use task::{DeadLetter, Payload, Response, Task, TaskStatus, into_payload};
