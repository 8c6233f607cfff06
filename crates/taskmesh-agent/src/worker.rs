//! Queue worker
//!
//! A worker pulls tasks from `agent_task`, hands each to an agent from its
//! registry under the job's timeout, records the outcome on the message and in
//! the queue's job registry, and answers on `agent_response`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, AgentType, DEAD_LETTER_QUEUE, DeadLetter, MessageId,
    OrchestrationError, OrchestrationResult, Response, Task, TaskStatus,
};
use taskmesh_queue::{DEFAULT_JOB_TIMEOUT, Job, JobOutcome, QueueManager};

use crate::registry::AgentRegistry;
use crate::runtime::ManagedAgent;

/// How long one poll blocks on an empty queue
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was waiting
    Idle,
    Completed(MessageId),
    Failed(MessageId),
}

/// Pulls tasks from the queue and runs them on registered agents
pub struct Worker {
    queues: QueueManager,
    agents: Arc<AgentRegistry>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queues: QueueManager, agents: Arc<AgentRegistry>) -> Self {
        Self {
            queues,
            agents,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// Take at most one task from the queue and process it
    pub async fn run_once(&self) -> OrchestrationResult<WorkOutcome> {
        let Some(job) = self
            .queues
            .dequeue::<Task>(AGENT_TASK_QUEUE, self.poll_interval)
            .await?
        else {
            return Ok(WorkOutcome::Idle);
        };

        let response = self.process(&job).await;
        let task_id = job.message_id();

        let (status, outcome) = if response.is_success() {
            (TaskStatus::Completed, JobOutcome::Finished)
        } else {
            (TaskStatus::Failed, JobOutcome::Failed)
        };
        self.queues
            .update_message_status(task_id, status, response.error())
            .await?;
        self.queues.complete_job(&job, outcome).await?;
        if let Err(e) = self
            .queues
            .enqueue(AGENT_RESPONSE_QUEUE, &response, DEFAULT_JOB_TIMEOUT)
            .await
        {
            self.dead_letter_response(&job.payload, &response, &e).await;
            return Err(e);
        }

        match outcome {
            JobOutcome::Finished => {
                info!(task_id = %task_id, "Job finished");
                Ok(WorkOutcome::Completed(task_id))
            }
            JobOutcome::Failed => {
                warn!(task_id = %task_id, "Job failed: {}", response.error().unwrap_or_default());
                Ok(WorkOutcome::Failed(task_id))
            }
        }
    }

    /// Park a task whose response could not be delivered
    async fn dead_letter_response(
        &self,
        task: &Task,
        response: &Response,
        cause: &OrchestrationError,
    ) {
        let outcome = match response.error() {
            Some(reason) => format!("failed: {reason}"),
            None => "completed".to_string(),
        };
        let letter = DeadLetter::new(
            task.clone(),
            format!("Response undeliverable (task {outcome}): {cause}"),
        );
        match self
            .queues
            .enqueue(DEAD_LETTER_QUEUE, &letter, DEFAULT_JOB_TIMEOUT)
            .await
        {
            Ok(_) => warn!(
                task_id = %task.message_id,
                "Dead-lettered task with undelivered response"
            ),
            Err(e) => error!(
                task_id = %task.message_id,
                "Failed to dead-letter task with undelivered response: {}", e
            ),
        }
    }

    async fn process(&self, job: &Job<Task>) -> Response {
        let task = &job.payload;

        let agent = task
            .agent_type
            .parse::<AgentType>()
            .ok()
            .and_then(|agent_type| self.agents.select(agent_type));
        let Some(agent) = agent else {
            let err = OrchestrationError::NoAgentFound {
                agent_type: task.agent_type.clone(),
            };
            return Response::failure(task.message_id, err.to_string());
        };

        debug!(
            task_id = %task.message_id,
            agent_id = %agent.agent_id(),
            "Dispatching task"
        );

        let timeout = job.timeout();
        match tokio::time::timeout(timeout, agent.handle_task(task)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => Response::failure(task.message_id, e.to_string()),
            Err(_) => Response::failure(
                task.message_id,
                format!(
                    "Task exceeded job timeout of {}",
                    humantime::format_duration(timeout)
                ),
            ),
        }
    }

    /// Process tasks until `shutdown` turns true
    ///
    /// The signal is checked between jobs, so a job that was taken is always
    /// finished. Broker failures are logged and retried after one poll
    /// interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OrchestrationResult<()> {
        info!(agents = self.agents.len(), "Worker started");

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(WorkOutcome::Idle) if self.poll_interval.is_zero() => {
                    tokio::task::yield_now().await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Worker iteration failed: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, BoxError, EchoAgent};
    use crate::runtime::{AgentRuntime, RuntimeOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use taskmesh_broker::InMemoryBroker;
    use taskmesh_core::{AgentId, BrokerError, RetryPolicy, into_payload};
    use taskmesh_queue::QueueStats;

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::QualityAssurance
        }

        async fn process_task(&self, _task: &Task) -> Result<Response, BoxError> {
            Err("review model unavailable".into())
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::ContentGenerator
        }

        async fn process_task(&self, task: &Task) -> Result<Response, BoxError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(Response::success(task.message_id, task.task_data.clone()))
        }
    }

    async fn setup() -> (QueueManager, Arc<AgentRegistry>, Worker) {
        let broker: Arc<InMemoryBroker> = Arc::new(InMemoryBroker::new());
        let queues = QueueManager::new(broker.clone()).with_retry_policy(RetryPolicy::none());
        let registry = Arc::new(AgentRegistry::new());

        let echo = AgentRuntime::start(
            EchoAgent,
            broker.clone(),
            RuntimeOptions::default().with_agent_id(AgentId::parse("echo-1").unwrap()),
        )
        .await
        .unwrap();
        let failing = AgentRuntime::start(FailingAgent, broker.clone(), RuntimeOptions::default())
            .await
            .unwrap();
        let slow = AgentRuntime::start(SlowAgent, broker.clone(), RuntimeOptions::default())
            .await
            .unwrap();
        registry.register(Arc::new(echo));
        registry.register(Arc::new(failing));
        registry.register(Arc::new(slow));

        let worker = Worker::new(queues.clone(), Arc::clone(&registry))
            .with_poll_interval(Duration::ZERO);
        (queues, registry, worker)
    }

    async fn submit(queues: &QueueManager, agent_type: &str, timeout: Duration) -> MessageId {
        let task = Task::new(agent_type, into_payload(json!({"x": 1})));
        queues
            .enqueue(AGENT_TASK_QUEUE, &task, timeout)
            .await
            .unwrap()
    }

    async fn next_response(queues: &QueueManager) -> Response {
        queues
            .dequeue::<Response>(AGENT_RESPONSE_QUEUE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let (_queues, _registry, worker) = setup().await;
        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Idle);
    }

    #[tokio::test]
    async fn test_success_path() {
        let (queues, registry, worker) = setup().await;
        let id = submit(&queues, "Echo", DEFAULT_JOB_TIMEOUT).await;

        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Completed(id));

        let record = queues.get_message_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        let response = next_response(&queues).await;
        assert_eq!(response.task_id(), id);
        assert_eq!(response.result()["x"], json!(1));

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats["agent_task"].finished, 1);

        let echo = registry.get(&AgentId::parse("echo-1").unwrap()).unwrap();
        assert_eq!(echo.get_health_status().health_metrics.tasks_processed, 1);
    }

    #[tokio::test]
    async fn test_processing_failure_is_recorded_not_dead_lettered() {
        let (queues, _registry, worker) = setup().await;
        let id = submit(&queues, "QualityAssurance", DEFAULT_JOB_TIMEOUT).await;

        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Failed(id));

        let record = queues.get_message_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("Task processing failed: review model unavailable")
        );

        let response = next_response(&queues).await;
        assert!(!response.is_success());

        let stats = queues.get_queue_stats().await.unwrap();
        assert_eq!(stats["agent_task"].failed, 1);
        assert_eq!(stats["dead_letter"], QueueStats::default());
    }

    #[tokio::test]
    async fn test_undelivered_response_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let queues =
            QueueManager::new(Arc::new(broker.clone())).with_retry_policy(RetryPolicy::none());
        let registry = Arc::new(AgentRegistry::new());
        let echo = AgentRuntime::start(
            EchoAgent,
            Arc::new(broker.clone()),
            RuntimeOptions::default(),
        )
        .await
        .unwrap();
        registry.register(Arc::new(echo));
        let worker = Worker::new(queues.clone(), registry).with_poll_interval(Duration::ZERO);

        let id = submit(&queues, "Echo", DEFAULT_JOB_TIMEOUT).await;
        broker.fail_pushes(
            "queue:agent_response",
            BrokerError::Connection("reset".into()),
            None,
        );

        assert!(worker.run_once().await.is_err());

        let record = queues.get_message_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        let letters = queues
            .peek::<DeadLetter>(DEAD_LETTER_QUEUE, 10)
            .await
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task.message_id, id);
        assert!(letters[0].error.starts_with("Response undeliverable (task completed)"));
    }

    #[tokio::test]
    async fn test_no_agent_for_type() {
        let (queues, _registry, worker) = setup().await;
        let id = submit(&queues, "ModulePlanner", DEFAULT_JOB_TIMEOUT).await;

        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Failed(id));
        let response = next_response(&queues).await;
        assert_eq!(
            response.error(),
            Some("No suitable agent found for task type: ModulePlanner")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout() {
        let (queues, registry, worker) = setup().await;
        let id = submit(&queues, "ContentGenerator", Duration::from_secs(60)).await;

        assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Failed(id));
        let response = next_response(&queues).await;
        assert!(response.error().unwrap().contains("job timeout"));

        for agent in registry.agents() {
            assert_eq!(agent.state(), crate::AgentState::Idle);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (queues, _registry, worker) = setup().await;
        let worker = worker.with_poll_interval(Duration::from_millis(10));
        let id = submit(&queues, "Echo", DEFAULT_JOB_TIMEOUT).await;

        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(shutdown).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = queues.get_message_status(id).await.unwrap().unwrap();
            if record.status == TaskStatus::Completed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
