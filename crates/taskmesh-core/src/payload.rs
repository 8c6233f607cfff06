//! Queue payload schemas
//!
//! Each named queue is bound to exactly one [`PayloadSchema`]. Message types
//! declare their schema through [`QueuePayload`], which lets the queue manager
//! reject a mismatched enqueue before anything reaches the broker.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::ids::MessageId;
use crate::task::{DeadLetter, Response, Task};

/// Queue that carries tasks to workers
pub const AGENT_TASK_QUEUE: &str = "agent_task";
/// Queue that carries agent responses back to the coordinator
pub const AGENT_RESPONSE_QUEUE: &str = "agent_response";
/// Holding queue for undeliverable tasks
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Shape of the messages a queue accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadSchema {
    AgentTask,
    AgentResponse,
    DeadLetter,
}

impl PayloadSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadSchema::AgentTask => "AgentTask",
            PayloadSchema::AgentResponse => "AgentResponse",
            PayloadSchema::DeadLetter => "DeadLetter",
        }
    }
}

impl fmt::Display for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that can travel through a typed queue
pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync {
    /// Schema this message type satisfies
    const SCHEMA: PayloadSchema;

    /// Id the queue manager keys the status record by
    fn message_id(&self) -> MessageId;
}

impl QueuePayload for Task {
    const SCHEMA: PayloadSchema = PayloadSchema::AgentTask;

    fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl QueuePayload for Response {
    const SCHEMA: PayloadSchema = PayloadSchema::AgentResponse;

    fn message_id(&self) -> MessageId {
        Response::message_id(self)
    }
}

impl QueuePayload for DeadLetter {
    const SCHEMA: PayloadSchema = PayloadSchema::DeadLetter;

    fn message_id(&self) -> MessageId {
        self.message_id
    }
}
