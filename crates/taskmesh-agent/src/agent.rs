//! The processing interface concrete agents implement

use async_trait::async_trait;

use taskmesh_core::{AgentType, Response, Task};

/// Error type returned by agent processing logic
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processing logic for one agent type
///
/// Implementors only turn a task into a response. Lifecycle state, health
/// metrics, and persistence belong to the [`AgentRuntime`](crate::AgentRuntime)
/// that hosts the agent.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// The agent type this logic serves
    fn agent_type(&self) -> AgentType;

    /// Process one task
    async fn process_task(&self, task: &Task) -> Result<Response, BoxError>;
}

/// Answers every task with its own task data
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Echo
    }

    async fn process_task(&self, task: &Task) -> Result<Response, BoxError> {
        Ok(Response::success(task.message_id, task.task_data.clone()))
    }
}
