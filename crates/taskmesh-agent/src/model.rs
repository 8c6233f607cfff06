//! Model invocation collaborator
//!
//! Agents that need a language model talk to it through [`ModelClient`]. The
//! transport behind it is not this crate's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use taskmesh_core::{AgentType, Response, Task, into_payload};

use crate::agent::{Agent, BoxError};

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the ordered conversation sent to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// `invoke_model(messages) -> text`
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    async fn invoke_model(&self, messages: &[ChatMessage]) -> Result<String, BoxError>;
}

/// Agent that forwards the task data to a model and returns its reply
///
/// The task data is sent as a JSON user message after the agent's
/// instructions. The reply lands under `content` in the response.
pub struct ModelAgent<M> {
    agent_type: AgentType,
    instructions: String,
    model: M,
}

impl<M: ModelClient> ModelAgent<M> {
    pub fn new(agent_type: AgentType, instructions: impl Into<String>, model: M) -> Self {
        Self {
            agent_type,
            instructions: instructions.into(),
            model,
        }
    }
}

#[async_trait]
impl<M: ModelClient> Agent for ModelAgent<M> {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn process_task(&self, task: &Task) -> Result<Response, BoxError> {
        let messages = [
            ChatMessage::system(&self.instructions),
            ChatMessage::user(serde_json::to_string(&task.task_data)?),
        ];
        let reply = self.model.invoke_model(&messages).await?;
        Ok(Response::success(
            task.message_id,
            into_payload(json!({ "content": reply })),
        ))
    }
}
