//! Message status records and job references

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use taskmesh_core::{MessageId, OrchestrationError, OrchestrationResult, TaskStatus};

const FIELD_DATA: &str = "data";
const FIELD_QUEUE_TYPE: &str = "queue_type";
const FIELD_STATUS: &str = "status";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";
const FIELD_UPDATED_AT: &str = "updated_at";
const FIELD_ERROR: &str = "error";

/// Stored status of one enqueued message (`message:<id>`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    /// The message exactly as it was enqueued
    pub data: Value,
    pub queue_type: String,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MessageRecord {
    /// Hash fields written when a message is first enqueued
    pub(crate) fn pending_fields(
        data: String,
        queue: &str,
        enqueued_at: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_DATA, data),
            (FIELD_QUEUE_TYPE, queue.to_string()),
            (FIELD_STATUS, TaskStatus::Pending.as_str().to_string()),
            (FIELD_ENQUEUED_AT, enqueued_at.to_rfc3339()),
        ]
    }

    /// Hash fields written by a status update
    pub(crate) fn status_fields(
        status: TaskStatus,
        error: Option<&str>,
    ) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_STATUS, status.as_str().to_string()),
            (FIELD_UPDATED_AT, Utc::now().to_rfc3339()),
        ];
        if let Some(error) = error {
            fields.push((FIELD_ERROR, error.to_string()));
        }
        fields
    }

    /// Rebuild a record from its stored hash
    pub(crate) fn from_hash(
        message_id: MessageId,
        hash: &HashMap<String, String>,
    ) -> OrchestrationResult<Self> {
        let field = |name: &str| {
            hash.get(name).ok_or_else(|| {
                OrchestrationError::Serialization(format!(
                    "message record {message_id} is missing field '{name}'"
                ))
            })
        };

        let status = field(FIELD_STATUS)?
            .parse::<TaskStatus>()
            .map_err(OrchestrationError::Serialization)?;

        Ok(Self {
            message_id,
            data: serde_json::from_str(field(FIELD_DATA)?)?,
            queue_type: field(FIELD_QUEUE_TYPE)?.clone(),
            status,
            enqueued_at: parse_timestamp(field(FIELD_ENQUEUED_AT)?)?,
            updated_at: hash
                .get(FIELD_UPDATED_AT)
                .map(|raw| parse_timestamp(raw))
                .transpose()?,
            error: hash.get(FIELD_ERROR).cloned(),
        })
    }

    /// Decode the stored message into its typed form
    pub fn payload<P: DeserializeOwned>(&self) -> OrchestrationResult<P> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

fn parse_timestamp(raw: &str) -> OrchestrationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| OrchestrationError::Serialization(format!("bad timestamp '{raw}': {e}")))
}

/// Reference to an enqueued message, as pushed onto the queue's job list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub message_id: MessageId,
    pub queue: String,
    /// Processing ceiling for the worker that picks the job up
    pub timeout_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// A dequeued job with its decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct Job<P> {
    pub reference: JobRef,
    pub payload: P,
}

impl<P> Job<P> {
    pub fn message_id(&self) -> MessageId {
        self.reference.message_id
    }

    pub fn queue(&self) -> &str {
        &self.reference.queue
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reference.timeout_secs)
    }
}

/// How a started job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed,
}

impl JobOutcome {
    pub(crate) fn registry_field(&self) -> &'static str {
        match self {
            JobOutcome::Finished => "finished",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Per-queue counts reported by `get_queue_stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting in the queue
    pub queued: u64,
    pub failed: u64,
    /// Jobs taken by a worker but not yet completed
    pub started: u64,
    pub finished: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_pending_record_round_trips_through_hash() {
        let id = MessageId::new();
        let now = Utc::now();
        let hash = stored(MessageRecord::pending_fields(
            json!({"x": 1}).to_string(),
            "agent_task",
            now,
        ));

        let record = MessageRecord::from_hash(id, &hash).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.queue_type, "agent_task");
        assert_eq!(record.data, json!({"x": 1}));
        assert_eq!(record.updated_at, None);
        assert_eq!(record.error, None);
    }

    #[test]
    fn test_status_fields_include_error_only_when_given() {
        let fields = MessageRecord::status_fields(TaskStatus::Completed, None);
        assert!(fields.iter().all(|(k, _)| *k != "error"));

        let fields = MessageRecord::status_fields(TaskStatus::Failed, Some("boom"));
        assert!(fields.contains(&("error", "boom".to_string())));
    }

    #[test]
    fn test_missing_field_is_reported() {
        let mut hash = stored(MessageRecord::pending_fields(
            "{}".into(),
            "agent_task",
            Utc::now(),
        ));
        hash.remove("status");

        let err = MessageRecord::from_hash(MessageId::new(), &hash).unwrap_err();
        assert!(err.to_string().contains("status"));
    }
}
