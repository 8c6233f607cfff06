//! Error types for orchestration operations
//!
//! [`OrchestrationError`] is the sum type every public operation returns. The
//! retry and dead-letter policy is read straight off the variant through
//! [`OrchestrationError::is_retryable`] and
//! [`OrchestrationError::should_dead_letter`].

use thiserror::Error;

use crate::agent_type::UnknownAgentType;
use crate::ids::AgentId;
use crate::payload::PayloadSchema;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Errors raised by a broker substrate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection to the broker failed or was dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A broker command did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Any other backend failure (wrong type, script error, ...)
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Connectivity failures are worth retrying; everything else is not
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Timeout(_))
    }
}

/// Errors that may be retried by a [`RetryPolicy`](crate::retry::RetryPolicy)
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

/// Errors produced by the queue manager, agent runtime, config manager, and
/// coordinator
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// No registered agent can serve the task's declared type
    #[error("No suitable agent found for task type: {agent_type}")]
    NoAgentFound { agent_type: String },

    /// The task could not be handed to the queue after an agent was found
    #[error("Delivery failed: {reason}")]
    DeliveryFailed { retryable: bool, reason: String },

    /// The agent's processing logic failed
    #[error("Task processing failed: {cause}")]
    ProcessingFailed { agent_id: AgentId, cause: String },

    /// The agent runtime has been shut down
    #[error("Agent {agent_id} is shut down")]
    AgentShutdown { agent_id: AgentId },

    /// Message shape does not match the schema bound to the queue
    #[error("Queue '{queue}' expects {expected} messages, got {found}")]
    TypeMismatch {
        queue: String,
        expected: PayloadSchema,
        found: PayloadSchema,
    },

    /// Queue name has no registration
    #[error("Invalid queue type: {0}")]
    UnknownQueue(String),

    /// Agent type name matches no known agent type
    #[error("No configuration found for agent type: {0}")]
    UnknownAgentType(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl OrchestrationError {
    /// Whether resubmitting the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::DeliveryFailed { retryable, .. } => *retryable,
            OrchestrationError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the failed task belongs in the dead-letter queue
    ///
    /// Only delivery failures are dead-lettered: routing errors have nothing to
    /// retry and processing errors are tracked by the job registry.
    pub fn should_dead_letter(&self) -> bool {
        matches!(self, OrchestrationError::DeliveryFailed { .. })
    }

    /// Wrap an enqueue failure that happened after an agent was selected
    pub fn delivery(err: OrchestrationError) -> Self {
        match err {
            already @ OrchestrationError::DeliveryFailed { .. } => already,
            other => OrchestrationError::DeliveryFailed {
                retryable: other.is_retryable(),
                reason: other.to_string(),
            },
        }
    }
}

impl Transient for OrchestrationError {
    fn is_transient(&self) -> bool {
        match self {
            OrchestrationError::Broker(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        OrchestrationError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OrchestrationError {
    fn from(err: std::io::Error) -> Self {
        OrchestrationError::Io(err.to_string())
    }
}

impl From<UnknownAgentType> for OrchestrationError {
    fn from(err: UnknownAgentType) -> Self {
        OrchestrationError::UnknownAgentType(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_transience() {
        assert!(BrokerError::Connection("refused".into()).is_transient());
        assert!(BrokerError::Timeout("3s".into()).is_transient());
        assert!(!BrokerError::Backend("WRONGTYPE".into()).is_transient());
        assert!(!BrokerError::Serialization("bad json".into()).is_transient());
    }

    #[test]
    fn test_no_agent_found_message() {
        let err = OrchestrationError::NoAgentFound {
            agent_type: "Nonexistent".into(),
        };
        assert_eq!(
            err.to_string(),
            "No suitable agent found for task type: Nonexistent"
        );
        assert!(!err.is_retryable());
        assert!(!err.should_dead_letter());
    }

    #[test]
    fn test_delivery_wraps_transient_broker_error() {
        let err = OrchestrationError::delivery(BrokerError::Connection("down".into()).into());
        assert!(err.is_retryable());
        assert!(err.should_dead_letter());
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn test_delivery_wraps_permanent_error() {
        let err = OrchestrationError::delivery(OrchestrationError::UnknownQueue("nope".into()));
        assert!(!err.is_retryable());
        assert!(err.should_dead_letter());
    }

    #[test]
    fn test_processing_failed_message() {
        let err = OrchestrationError::ProcessingFailed {
            agent_id: AgentId::parse("echo-1").unwrap(),
            cause: "boom".into(),
        };
        assert_eq!(err.to_string(), "Task processing failed: boom");
    }
}
