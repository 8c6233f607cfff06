//! Task, response, and dead-letter messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::ids::{MessageId, RequestId};

/// Opaque key/value payload carried by tasks and responses
pub type Payload = serde_json::Map<String, Value>;

/// Convert any JSON value into a [`Payload`].
///
/// Objects are used as-is; any other value is wrapped under a `"value"` key.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Lifecycle status of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and failed messages receive no further processing
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work submitted for processing by an agent
///
/// The agent type is kept as the producer submitted it; resolving it against
/// the known agent types is the coordinator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub agent_type: String,
    pub task_data: Payload,
    pub parent_request_id: RequestId,
    /// Advisory only; never used to order execution.
    #[serde(default)]
    pub dependencies: BTreeSet<MessageId>,
}

impl Task {
    /// Create a pending task with a fresh message id and parent request id
    pub fn new(agent_type: impl Into<String>, task_data: Payload) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            retry_count: 0,
            status: TaskStatus::Pending,
            agent_type: agent_type.into(),
            task_data,
            parent_request_id: RequestId::new(),
            dependencies: BTreeSet::new(),
        }
    }

    /// Attach the task to an existing external request
    pub fn with_parent_request(mut self, parent_request_id: RequestId) -> Self {
        self.parent_request_id = parent_request_id;
        self
    }

    /// Use a caller-chosen message id, making re-submission idempotent
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Record a task this one depends on
    pub fn with_dependency(mut self, dependency: MessageId) -> Self {
        self.dependencies.insert(dependency);
        self
    }
}

/// Result of processing one task
///
/// Built through [`Response::success`] or [`Response::failure`], so a terminal
/// response carries either a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    message_id: MessageId,
    timestamp: DateTime<Utc>,
    status: TaskStatus,
    task_id: MessageId,
    result: Payload,
    error: Option<String>,
}

impl Response {
    pub fn success(task_id: MessageId, result: Payload) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            status: TaskStatus::Completed,
            task_id,
            result,
            error: None,
        }
    }

    pub fn failure(task_id: MessageId, error: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            status: TaskStatus::Failed,
            task_id,
            result: Payload::new(),
            error: Some(error.into()),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Id of the task this response answers
    pub fn task_id(&self) -> MessageId {
        self.task_id
    }

    pub fn result(&self) -> &Payload {
        &self.result
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A task that could not be delivered, held for operator inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub task: Task,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: Task, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id: MessageId::new(),
            timestamp: now,
            task,
            error: error.into(),
            failed_at: now,
        }
    }
}
