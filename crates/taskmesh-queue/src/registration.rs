//! Queue registrations
//!
//! Every named queue is bound to exactly one payload schema. The registry is
//! consulted before any broker call so mismatched messages never reach the
//! substrate.

use std::collections::BTreeMap;

use taskmesh_core::{
    AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, DEAD_LETTER_QUEUE, OrchestrationError,
    OrchestrationResult, PayloadSchema, QueuePayload,
};

/// Named queues and the schema each one accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRegistry {
    queues: BTreeMap<String, PayloadSchema>,
}

impl Default for QueueRegistry {
    /// `agent_task`, `agent_response` and `dead_letter`
    fn default() -> Self {
        Self::empty()
            .with_queue(AGENT_TASK_QUEUE, PayloadSchema::AgentTask)
            .with_queue(AGENT_RESPONSE_QUEUE, PayloadSchema::AgentResponse)
            .with_queue(DEAD_LETTER_QUEUE, PayloadSchema::DeadLetter)
    }
}

impl QueueRegistry {
    /// A registry with no queues at all
    pub fn empty() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }

    /// Bind `name` to `schema`, replacing any earlier binding
    pub fn with_queue(mut self, name: impl Into<String>, schema: PayloadSchema) -> Self {
        self.queues.insert(name.into(), schema);
        self
    }

    /// Schema bound to `name`
    pub fn schema(&self, name: &str) -> OrchestrationResult<PayloadSchema> {
        self.queues
            .get(name)
            .copied()
            .ok_or_else(|| OrchestrationError::UnknownQueue(name.to_string()))
    }

    /// Reject `P` unless `name` is registered with `P`'s schema
    pub fn check<P: QueuePayload>(&self, name: &str) -> OrchestrationResult<()> {
        let expected = self.schema(name)?;
        if expected != P::SCHEMA {
            return Err(OrchestrationError::TypeMismatch {
                queue: name.to_string(),
                expected,
                found: P::SCHEMA,
            });
        }
        Ok(())
    }

    /// Registered queue names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::{DeadLetter, Response, Task};

    #[test]
    fn test_default_registrations() {
        let registry = QueueRegistry::default();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["agent_response", "agent_task", "dead_letter"]);
        assert_eq!(
            registry.schema("agent_task").unwrap(),
            PayloadSchema::AgentTask
        );
    }

    #[test]
    fn test_check_accepts_bound_schema() {
        let registry = QueueRegistry::default();
        assert!(registry.check::<Task>("agent_task").is_ok());
        assert!(registry.check::<Response>("agent_response").is_ok());
        assert!(registry.check::<DeadLetter>("dead_letter").is_ok());
    }

    #[test]
    fn test_check_rejects_mismatch() {
        let registry = QueueRegistry::default();
        let err = registry.check::<Response>("agent_task").unwrap_err();
        match err {
            OrchestrationError::TypeMismatch {
                queue,
                expected,
                found,
            } => {
                assert_eq!(queue, "agent_task");
                assert_eq!(expected, PayloadSchema::AgentTask);
                assert_eq!(found, PayloadSchema::AgentResponse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_queue() {
        let err = QueueRegistry::default()
            .check::<Task>("content_generation")
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid queue type: content_generation");
    }
}
