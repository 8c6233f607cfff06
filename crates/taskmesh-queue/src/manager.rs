//! Typed queue manager
//!
//! Enqueue writes a status record under `message:<id>` and then pushes a
//! [`JobRef`] onto `queue:<name>`. Workers pop job references, load the record,
//! and report the outcome into the queue's job registry
//! (`queue:<name>:registry`), which is what [`QueueManager::get_queue_stats`]
//! reads back.

use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use taskmesh_broker::Broker;
use taskmesh_core::{
    BrokerResult, MessageId, OrchestrationError, OrchestrationResult, QueuePayload, RetryPolicy,
    TaskStatus, keys,
};

use crate::record::{Job, JobOutcome, JobRef, MessageRecord, QueueStats};
use crate::registration::QueueRegistry;

/// Processing ceiling applied when callers have no better value
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

const REGISTRY_STARTED: &str = "started";
const REGISTRY_FINISHED: &str = "finished";
const REGISTRY_FAILED: &str = "failed";

/// Schema-checked enqueue/dequeue with per-message status tracking
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use taskmesh_broker::InMemoryBroker;
/// use taskmesh_core::{Payload, Task, AGENT_TASK_QUEUE};
/// use taskmesh_queue::{QueueManager, DEFAULT_JOB_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let queues = QueueManager::new(Arc::new(InMemoryBroker::new()));
/// let task = Task::new("Echo", Payload::new());
///
/// let id = queues.enqueue(AGENT_TASK_QUEUE, &task, DEFAULT_JOB_TIMEOUT).await?;
/// assert_eq!(id, task.message_id);
///
/// let record = queues.get_message_status(id).await?.expect("record exists");
/// assert_eq!(record.queue_type, AGENT_TASK_QUEUE);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    registry: QueueRegistry,
    retry: RetryPolicy,
}

impl QueueManager {
    /// Queue manager with the default registrations and retry policy
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: QueueRegistry::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_registry(mut self, registry: QueueRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    async fn retried<T, F, Fut>(&self, operation: &str, op: F) -> OrchestrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        Ok(self.retry.run(operation, op).await?)
    }

    /// Enqueue `message` onto `queue`, returning its message id
    ///
    /// The schema check runs before any broker call. The record write and the
    /// job push are retried together on transient broker failures.
    pub async fn enqueue<P: QueuePayload>(
        &self,
        queue: &str,
        message: &P,
        timeout: Duration,
    ) -> OrchestrationResult<MessageId> {
        self.registry.check::<P>(queue)?;

        let message_id = message.message_id();
        let enqueued_at = Utc::now();
        let data = serde_json::to_string(message)?;
        let job = serde_json::to_string(&JobRef {
            message_id,
            queue: queue.to_string(),
            timeout_secs: timeout.as_secs(),
            enqueued_at,
        })?;

        let broker = &self.broker;
        let record_key = keys::message(&message_id);
        let record_key = record_key.as_str();
        let queue_key = keys::queue(queue);
        let queue_key = queue_key.as_str();
        let fields = MessageRecord::pending_fields(data, queue, enqueued_at);
        let fields = fields.as_slice();
        let job = job.as_str();

        self.retried("enqueue", move || async move {
            broker.hset(record_key, fields).await?;
            broker.push(queue_key, job.to_string()).await
        })
        .await?;

        debug!(queue, message_id = %message_id, "Enqueued message");
        Ok(message_id)
    }

    /// Take the next job from `queue`, waiting up to `wait`
    ///
    /// The message is marked `processing` and counted as started. Job
    /// references whose status record has vanished are skipped. When the claim
    /// fails on the broker after the reference was popped, the reference goes
    /// back on the queue before the error is returned.
    pub async fn dequeue<P: QueuePayload>(
        &self,
        queue: &str,
        wait: Duration,
    ) -> OrchestrationResult<Option<Job<P>>> {
        self.registry.check::<P>(queue)?;
        let queue_key = keys::queue(queue);
        let mut wait = wait;

        loop {
            let broker = &self.broker;
            let key = queue_key.as_str();
            let raw = self
                .retried("dequeue", move || async move { broker.pop(key, wait).await })
                .await?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            wait = Duration::ZERO;

            let reference: JobRef = match serde_json::from_str(&raw) {
                Ok(reference) => reference,
                Err(e) => {
                    warn!(queue, "Discarding unreadable job reference: {}", e);
                    continue;
                }
            };
            let message_id = reference.message_id;

            let record = match self.get_message_status(message_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(queue, message_id = %message_id, "Skipping job without a status record");
                    continue;
                }
                Err(e) => return Err(self.requeue(key, raw, message_id, e).await),
            };

            let payload = match record.payload::<P>() {
                Ok(payload) => payload,
                Err(e) => {
                    let reason = e.to_string();
                    self.update_message_status(message_id, TaskStatus::Failed, Some(&reason))
                        .await?;
                    self.bump_registry(queue, REGISTRY_FAILED, 1).await?;
                    return Err(e);
                }
            };

            if let Err(e) = self.mark_started(queue, message_id).await {
                return Err(self.requeue(key, raw, message_id, e).await);
            }

            debug!(queue, message_id = %message_id, "Dequeued message");
            return Ok(Some(Job { reference, payload }));
        }
    }

    async fn mark_started(&self, queue: &str, message_id: MessageId) -> OrchestrationResult<()> {
        self.update_message_status(message_id, TaskStatus::Processing, None)
            .await?;
        self.bump_registry(queue, REGISTRY_STARTED, 1).await
    }

    /// Put a popped reference back at the tail of its queue
    ///
    /// Returns `cause` so the caller still sees why the claim failed.
    async fn requeue(
        &self,
        queue_key: &str,
        raw: String,
        message_id: MessageId,
        cause: OrchestrationError,
    ) -> OrchestrationError {
        let broker = &self.broker;
        let raw = raw.as_str();
        let pushed = self
            .retried("requeue", move || async move {
                broker.push(queue_key, raw.to_string()).await
            })
            .await;

        match pushed {
            Ok(()) => warn!(message_id = %message_id, "Requeued job after failed claim: {}", cause),
            Err(e) => error!(
                message_id = %message_id,
                "Job lost, requeue after failed claim ({}) also failed: {}", cause, e
            ),
        }
        cause
    }

    /// Status record of a message, if one was ever enqueued
    pub async fn get_message_status(
        &self,
        message_id: MessageId,
    ) -> OrchestrationResult<Option<MessageRecord>> {
        let broker = &self.broker;
        let key = keys::message(&message_id);
        let key = key.as_str();
        let hash = self
            .retried("get_message_status", move || async move {
                broker.hgetall(key).await
            })
            .await?;

        if hash.is_empty() {
            return Ok(None);
        }
        MessageRecord::from_hash(message_id, &hash).map(Some)
    }

    /// Update the status of a known message
    ///
    /// Returns `false` for ids that were never enqueued, so late or duplicate
    /// updates never fail the caller.
    pub async fn update_message_status(
        &self,
        message_id: MessageId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> OrchestrationResult<bool> {
        let broker = &self.broker;
        let key = keys::message(&message_id);
        let key = key.as_str();
        let fields = MessageRecord::status_fields(status, error);
        let fields = fields.as_slice();

        let updated = self
            .retried("update_message_status", move || async move {
                if !broker.exists(key).await? {
                    return Ok(false);
                }
                broker.hset(key, fields).await?;
                Ok(true)
            })
            .await?;

        if !updated {
            debug!(message_id = %message_id, "Status update for unknown message ignored");
        }
        Ok(updated)
    }

    /// Move a started job into the finished or failed registry
    pub async fn complete_job<P>(
        &self,
        job: &Job<P>,
        outcome: JobOutcome,
    ) -> OrchestrationResult<()> {
        self.bump_registry(job.queue(), REGISTRY_STARTED, -1).await?;
        self.bump_registry(job.queue(), outcome.registry_field(), 1)
            .await?;
        debug!(
            queue = job.queue(),
            message_id = %job.message_id(),
            outcome = outcome.registry_field(),
            "Completed job"
        );
        Ok(())
    }

    async fn bump_registry(&self, queue: &str, field: &str, delta: i64) -> OrchestrationResult<()> {
        let broker = &self.broker;
        let key = keys::queue_registry(queue);
        let key = key.as_str();
        self.retried("queue_registry", move || async move {
            broker.hincr(key, field, delta).await
        })
        .await?;
        Ok(())
    }

    /// Queued, started, finished and failed counts for every registered queue
    pub async fn get_queue_stats(&self) -> OrchestrationResult<BTreeMap<String, QueueStats>> {
        let mut stats = BTreeMap::new();

        for name in self.registry.names() {
            let queued = self.broker.len(&keys::queue(name)).await?;
            let registry = self.broker.hgetall(&keys::queue_registry(name)).await?;
            let count = |field: &str| {
                registry
                    .get(field)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .map_or(0, |n| n.max(0) as u64)
            };

            stats.insert(
                name.to_string(),
                QueueStats {
                    queued: queued as u64,
                    failed: count(REGISTRY_FAILED),
                    started: count(REGISTRY_STARTED),
                    finished: count(REGISTRY_FINISHED),
                },
            );
        }

        Ok(stats)
    }

    /// Up to `limit` queued messages, oldest first, without consuming them
    pub async fn peek<P: QueuePayload>(
        &self,
        queue: &str,
        limit: usize,
    ) -> OrchestrationResult<Vec<P>> {
        self.registry.check::<P>(queue)?;

        let raw = self.broker.range(&keys::queue(queue), limit).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            let reference: JobRef = serde_json::from_str(&entry)?;
            match self.get_message_status(reference.message_id).await? {
                Some(record) => messages.push(record.payload::<P>()?),
                None => warn!(
                    queue,
                    message_id = %reference.message_id,
                    "Queued job has no status record"
                ),
            }
        }
        Ok(messages)
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use taskmesh_broker::InMemoryBroker;
    use taskmesh_core::{
        AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, BrokerError, DEAD_LETTER_QUEUE, DeadLetter,
        Response, Task, into_payload,
    };

    fn manager() -> (InMemoryBroker, QueueManager) {
        let broker = InMemoryBroker::new();
        let manager =
            QueueManager::new(Arc::new(broker.clone())).with_retry_policy(RetryPolicy::immediate(3));
        (broker, manager)
    }

    fn echo_task() -> Task {
        Task::new("Echo", into_payload(json!({"x": 1})))
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_record_and_job() {
        let (broker, queues) = manager();
        let task = echo_task();

        let id = queues
            .enqueue(AGENT_TASK_QUEUE, &task, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        let record = queues.get_message_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.payload::<Task>().unwrap(), task);
        assert_eq!(broker.len("queue:agent_task").await.unwrap(), 1);
    }

    #[rstest]
    #[case(AGENT_RESPONSE_QUEUE)]
    #[case(DEAD_LETTER_QUEUE)]
    #[case("unknown")]
    #[tokio::test]
    async fn test_enqueue_rejects_wrong_queue_without_touching_broker(#[case] queue: &str) {
        let (broker, queues) = manager();
        let task = echo_task();

        assert!(queues.enqueue(queue, &task, DEFAULT_JOB_TIMEOUT).await.is_err());
        assert_eq!(broker.push_attempts(&keys::queue(queue)), 0);
        assert!(!broker.exists(&keys::message(&task.message_id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_retries_transient_failures() {
        let (broker, queues) = manager();
        broker.fail_pushes(
            "queue:agent_task",
            BrokerError::Connection("reset".into()),
            Some(2),
        );

        let id = queues
            .enqueue(AGENT_TASK_QUEUE, &echo_task(), DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(broker.push_attempts("queue:agent_task"), 3);
        assert!(queues.get_message_status(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_does_not_retry_permanent_failures() {
        let (broker, queues) = manager();
        broker.fail_pushes(
            "queue:agent_task",
            BrokerError::Backend("WRONGTYPE".into()),
            None,
        );

        let err = queues
            .enqueue(AGENT_TASK_QUEUE, &echo_task(), DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(broker.push_attempts("queue:agent_task"), 1);
    }

    #[tokio::test]
    async fn test_dequeue_marks_processing_and_started() {
        let (_broker, queues) = manager();
        let task = echo_task();
        queues
            .enqueue(AGENT_TASK_QUEUE, &task, Duration::from_secs(60))
            .await
            .unwrap();

        let job = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, task);
        assert_eq!(job.timeout(), Duration::from_secs(60));

        let record = queues.get_message_status(task.message_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Processing);

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats["agent_task"].started, 1);
        assert_eq!(stats["agent_task"].queued, 0);
    }

    #[tokio::test]
    async fn test_dequeue_empty_queue() {
        let (_broker, queues) = manager();
        let job = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_skips_jobs_without_records() {
        let (broker, queues) = manager();
        let orphan = JobRef {
            message_id: MessageId::new(),
            queue: AGENT_TASK_QUEUE.into(),
            timeout_secs: 10,
            enqueued_at: Utc::now(),
        };
        broker
            .push("queue:agent_task", serde_json::to_string(&orphan).unwrap())
            .await
            .unwrap();
        let task = echo_task();
        queues
            .enqueue(AGENT_TASK_QUEUE, &task, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        let job = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.message_id(), task.message_id);
    }

    #[tokio::test]
    async fn test_dequeue_discards_unreadable_references() {
        let (broker, queues) = manager();
        broker
            .push("queue:agent_task", "not a job".to_string())
            .await
            .unwrap();
        let task = echo_task();
        queues
            .enqueue(AGENT_TASK_QUEUE, &task, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        let job = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.message_id(), task.message_id);
    }

    #[tokio::test]
    async fn test_failed_claim_puts_job_back() {
        let (broker, queues) = manager();
        let task = echo_task();
        queues
            .enqueue(AGENT_TASK_QUEUE, &task, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();
        broker.fail_reads(
            &keys::message(&task.message_id),
            BrokerError::Timeout("read timed out".into()),
            None,
        );

        let err = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(broker.len("queue:agent_task").await.unwrap(), 1);

        broker.clear_faults();
        let record = queues.get_message_status(task.message_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        let job = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, task);
        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats["agent_task"].started, 1);
        assert_eq!(stats["agent_task"].queued, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_message_returns_false() {
        let (_broker, queues) = manager();
        let updated = queues
            .update_message_status(MessageId::new(), TaskStatus::Completed, None)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_update_known_message_records_error() {
        let (_broker, queues) = manager();
        let id = queues
            .enqueue(AGENT_TASK_QUEUE, &echo_task(), DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        assert!(
            queues
                .update_message_status(id, TaskStatus::Failed, Some("model timeout"))
                .await
                .unwrap()
        );

        let record = queues.get_message_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("model timeout"));
        assert!(record.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_job_moves_between_registries() {
        let (_broker, queues) = manager();
        for _ in 0..2 {
            queues
                .enqueue(AGENT_TASK_QUEUE, &echo_task(), DEFAULT_JOB_TIMEOUT)
                .await
                .unwrap();
        }

        let first = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let second = queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        queues.complete_job(&first, JobOutcome::Finished).await.unwrap();
        queues.complete_job(&second, JobOutcome::Failed).await.unwrap();

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(
            stats["agent_task"],
            QueueStats {
                queued: 0,
                failed: 1,
                started: 0,
                finished: 1,
            }
        );
        assert_eq!(stats["dead_letter"], QueueStats::default());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (_broker, queues) = manager();
        let first = DeadLetter::new(echo_task(), "connection refused");
        let second = DeadLetter::new(echo_task(), "timeout");
        queues
            .enqueue(DEAD_LETTER_QUEUE, &first, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();
        queues
            .enqueue(DEAD_LETTER_QUEUE, &second, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        let peeked: Vec<DeadLetter> = queues.peek(DEAD_LETTER_QUEUE, 10).await.unwrap();
        assert_eq!(peeked, vec![first.clone(), second]);

        let peeked: Vec<DeadLetter> = queues.peek(DEAD_LETTER_QUEUE, 1).await.unwrap();
        assert_eq!(peeked, vec![first]);

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats["dead_letter"].queued, 2);
    }

    #[tokio::test]
    async fn test_response_queue_round_trip() {
        let (_broker, queues) = manager();
        let response = Response::success(MessageId::new(), into_payload(json!({"ok": true})));
        queues
            .enqueue(AGENT_RESPONSE_QUEUE, &response, DEFAULT_JOB_TIMEOUT)
            .await
            .unwrap();

        let job = queues
            .dequeue::<Response>(AGENT_RESPONSE_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, response);
    }
}
