//! Message traces
//!
//! A trace follows one task from submission to its outcome. Status only moves
//! forward: `created` → `routed` → `completed` | `failed`. Late or duplicate
//! transitions are ignored rather than reverting the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use taskmesh_broker::Broker;
use taskmesh_core::{
    MessageId, OrchestrationError, OrchestrationResult, RequestId, RetryPolicy, Task, TraceId,
    keys,
};

/// Where a task is in its journey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Created,
    Routed,
    Completed,
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Created => "created",
            TraceStatus::Routed => "routed",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TraceStatus::Created => 0,
            TraceStatus::Routed => 1,
            TraceStatus::Completed | TraceStatus::Failed => 2,
        }
    }

    /// Whether moving to `next` goes forward
    pub fn can_advance_to(&self, next: TraceStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

impl FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TraceStatus::Created),
            "routed" => Ok(TraceStatus::Routed),
            "completed" => Ok(TraceStatus::Completed),
            "failed" => Ok(TraceStatus::Failed),
            other => Err(format!("unknown trace status: {other}")),
        }
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one task's routing and outcome (`trace:<id>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub task_id: MessageId,
    pub agent_type: String,
    pub status: TraceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Set once routed
    pub message_id: Option<MessageId>,
    /// Set on failure
    pub error: Option<String>,
    pub parent_request_id: RequestId,
}

impl Trace {
    fn from_hash(hash: &HashMap<String, String>) -> OrchestrationResult<Self> {
        let field = |name: &str| {
            hash.get(name).map(String::as_str).ok_or_else(|| {
                OrchestrationError::Serialization(format!("trace is missing field '{name}'"))
            })
        };
        let bad = |name: &str, e: &dyn fmt::Display| {
            OrchestrationError::Serialization(format!("trace field '{name}' is invalid: {e}"))
        };

        Ok(Self {
            trace_id: field("trace_id")?
                .parse::<TraceId>()
                .map_err(|e| bad("trace_id", &e))?,
            task_id: field("task_id")?
                .parse::<MessageId>()
                .map_err(|e| bad("task_id", &e))?,
            agent_type: field("agent_type")?.to_string(),
            status: field("status")?
                .parse::<TraceStatus>()
                .map_err(|e| bad("status", &e))?,
            created_at: parse_timestamp(field("created_at")?)
                .map_err(|e| bad("created_at", &e))?,
            updated_at: hash
                .get("updated_at")
                .map(|raw| parse_timestamp(raw))
                .transpose()
                .map_err(|e| bad("updated_at", &e))?,
            message_id: hash
                .get("message_id")
                .map(|raw| raw.parse::<MessageId>())
                .transpose()
                .map_err(|e| bad("message_id", &e))?,
            error: hash.get("error").cloned(),
            parent_request_id: field("parent_request_id")?
                .parse::<RequestId>()
                .map_err(|e| bad("parent_request_id", &e))?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// Broker-backed trace records plus the task → trace index
#[derive(Clone)]
pub struct TraceStore {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl TraceStore {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    /// Record a new `created` trace for `task`
    pub async fn create(&self, task: &Task) -> OrchestrationResult<Trace> {
        let trace = Trace {
            trace_id: TraceId::new(),
            task_id: task.message_id,
            agent_type: task.agent_type.clone(),
            status: TraceStatus::Created,
            created_at: Utc::now(),
            updated_at: None,
            message_id: None,
            error: None,
            parent_request_id: task.parent_request_id,
        };

        let broker = &self.broker;
        let key = keys::trace(&trace.trace_id);
        let key = key.as_str();
        let fields = [
            ("trace_id", trace.trace_id.to_string()),
            ("task_id", trace.task_id.to_string()),
            ("agent_type", trace.agent_type.clone()),
            ("status", trace.status.as_str().to_string()),
            ("created_at", trace.created_at.to_rfc3339()),
            ("parent_request_id", trace.parent_request_id.to_string()),
        ];
        let fields = fields.as_slice();
        let task_id = trace.task_id.to_string();
        let index = [(task_id.as_str(), trace.trace_id.to_string())];
        let index = index.as_slice();

        self.retry
            .run("create_trace", move || async move {
                broker.hset(key, fields).await?;
                broker.hset(keys::TRACE_INDEX, index).await
            })
            .await?;

        debug!(trace_id = %trace.trace_id, task_id = %trace.task_id, "Created trace");
        Ok(trace)
    }

    pub async fn get(&self, trace_id: TraceId) -> OrchestrationResult<Option<Trace>> {
        let hash = self.broker.hgetall(&keys::trace(&trace_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Trace::from_hash(&hash).map(Some)
    }

    /// Trace of the task with id `task_id`, via `trace_index`
    pub async fn find_by_task(&self, task_id: MessageId) -> OrchestrationResult<Option<Trace>> {
        let Some(raw) = self
            .broker
            .hget(keys::TRACE_INDEX, &task_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        let trace_id = raw.parse::<TraceId>().map_err(|e| {
            OrchestrationError::Serialization(format!("bad trace id '{raw}' in index: {e}"))
        })?;
        self.get(trace_id).await
    }

    /// Move a trace forward to `status`
    ///
    /// Returns `false`, writing nothing, when the trace is unknown or already
    /// at or past `status`.
    pub async fn advance(
        &self,
        trace_id: TraceId,
        status: TraceStatus,
        message_id: Option<MessageId>,
        error: Option<&str>,
    ) -> OrchestrationResult<bool> {
        let Some(current) = self.get(trace_id).await? else {
            debug!(trace_id = %trace_id, "Ignoring transition of unknown trace");
            return Ok(false);
        };
        if !current.status.can_advance_to(status) {
            debug!(
                trace_id = %trace_id,
                from = %current.status,
                to = %status,
                "Ignoring backward trace transition"
            );
            return Ok(false);
        }

        let mut fields = vec![
            ("status", status.as_str().to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        if let Some(message_id) = message_id {
            fields.push(("message_id", message_id.to_string()));
        }
        if let Some(error) = error {
            fields.push(("error", error.to_string()));
        }

        let broker = &self.broker;
        let key = keys::trace(&trace_id);
        let key = key.as_str();
        let fields = fields.as_slice();
        self.retry
            .run("update_trace", move || async move {
                broker.hset(key, fields).await
            })
            .await?;

        debug!(trace_id = %trace_id, status = %status, "Trace advanced");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use taskmesh_broker::InMemoryBroker;
    use taskmesh_core::Payload;

    fn any_status() -> impl Strategy<Value = TraceStatus> {
        prop_oneof![
            Just(TraceStatus::Created),
            Just(TraceStatus::Routed),
            Just(TraceStatus::Completed),
            Just(TraceStatus::Failed),
        ]
    }

    fn store() -> TraceStore {
        TraceStore::new(Arc::new(InMemoryBroker::new()), RetryPolicy::none())
    }

    #[test]
    fn test_transitions() {
        use TraceStatus::*;
        assert!(Created.can_advance_to(Routed));
        assert!(Created.can_advance_to(Failed));
        assert!(Routed.can_advance_to(Completed));
        assert!(Routed.can_advance_to(Failed));
        assert!(!Routed.can_advance_to(Created));
        assert!(!Routed.can_advance_to(Routed));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
    }

    #[tokio::test]
    async fn test_create_and_lookup_by_task() {
        let store = store();
        let task = Task::new("Echo", Payload::new());

        let created = store.create(&task).await.unwrap();
        assert_eq!(created.status, TraceStatus::Created);

        let found = store.find_by_task(task.message_id).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert_eq!(found.parent_request_id, task.parent_request_id);
        assert!(store.find_by_task(MessageId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_records_details() {
        let store = store();
        let task = Task::new("Echo", Payload::new());
        let trace = store.create(&task).await.unwrap();

        assert!(
            store
                .advance(trace.trace_id, TraceStatus::Routed, Some(task.message_id), None)
                .await
                .unwrap()
        );
        assert!(
            store
                .advance(trace.trace_id, TraceStatus::Failed, None, Some("worker crashed"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .advance(trace.trace_id, TraceStatus::Completed, None, None)
                .await
                .unwrap()
        );

        let stored = store.get(trace.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TraceStatus::Failed);
        assert_eq!(stored.message_id, Some(task.message_id));
        assert_eq!(stored.error.as_deref(), Some("worker crashed"));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_advance_unknown_trace() {
        let store = store();
        let advanced = store
            .advance(TraceId::new(), TraceStatus::Routed, None, None)
            .await
            .unwrap();
        assert!(!advanced);
    }

    proptest! {
        #[test]
        fn prop_status_never_moves_backward(steps in proptest::collection::vec(any_status(), 1..10)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let store = store();
                let trace = store.create(&Task::new("Echo", Payload::new())).await.unwrap();
                let mut current = TraceStatus::Created;

                for next in steps {
                    let advanced = store.advance(trace.trace_id, next, None, None).await.unwrap();
                    assert_eq!(advanced, current.can_advance_to(next));
                    if advanced {
                        current = next;
                    }
                    let stored = store.get(trace.trace_id).await.unwrap().unwrap();
                    assert_eq!(stored.status, current);
                }
            });
        }
    }
}
