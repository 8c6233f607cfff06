//! Task routing
//!
//! The coordinator is the submission side of the orchestration core. It checks
//! that a live agent of the requested type exists, opens a trace, enqueues the
//! task on `agent_task`, and records the outcome. Tasks that cannot be
//! delivered land in `dead_letter` with the reason attached.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use taskmesh_agent::{AgentRegistry, ManagedAgent};
use taskmesh_core::{
    AGENT_RESPONSE_QUEUE, AGENT_TASK_QUEUE, AgentId, AgentType, DEAD_LETTER_QUEUE, DeadLetter,
    MessageId, OrchestrationError, OrchestrationResult, Response, Task, TaskStatus, TraceId,
};
use taskmesh_queue::{DEFAULT_JOB_TIMEOUT, JobOutcome, QueueManager};

use crate::counters::{Counter, TraceCounters, TraceStatistics};
use crate::trace::{Trace, TraceStatus, TraceStore};

/// Routes tasks to agent types and keeps their traces
pub struct Coordinator {
    queues: QueueManager,
    agents: Arc<AgentRegistry>,
    traces: TraceStore,
    counters: TraceCounters,
}

impl Coordinator {
    /// Build a coordinator with its own agent registry
    ///
    /// Creates the `message_trace` counters if this is the first coordinator
    /// on the broker.
    pub async fn new(queues: QueueManager) -> OrchestrationResult<Self> {
        Self::with_agents(queues, Arc::new(AgentRegistry::new())).await
    }

    /// Build a coordinator over a registry shared with a local worker
    pub async fn with_agents(
        queues: QueueManager,
        agents: Arc<AgentRegistry>,
    ) -> OrchestrationResult<Self> {
        let broker = Arc::clone(queues.broker());
        let retry = queues.retry_policy();
        let counters = TraceCounters::new(Arc::clone(&broker), retry);
        counters.init().await?;

        Ok(Self {
            traces: TraceStore::new(broker, retry),
            counters,
            queues,
            agents,
        })
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn register_agent(&self, agent: Arc<dyn ManagedAgent>) {
        info!(
            agent_id = %agent.agent_id(),
            agent_type = %agent.agent_type(),
            "Registered agent"
        );
        if let Some(previous) = self.agents.register(agent) {
            warn!(agent_id = %previous.agent_id(), "Replaced agent with the same id");
        }
    }

    pub fn unregister_agent(&self, agent_id: &AgentId) -> Option<Arc<dyn ManagedAgent>> {
        let removed = self.agents.unregister(agent_id);
        if removed.is_some() {
            info!(agent_id = %agent_id, "Unregistered agent");
        }
        removed
    }

    /// Route `task` to its agent type's queue, returning the queued message id
    ///
    /// # Errors
    ///
    /// - [`OrchestrationError::NoAgentFound`] when no live agent serves the
    ///   task's type; nothing is written in that case
    /// - [`OrchestrationError::DeliveryFailed`] when the enqueue still fails
    ///   after retries; the trace is marked failed and the task is
    ///   dead-lettered first
    pub async fn route_task(&self, task: &Task) -> OrchestrationResult<MessageId> {
        // The worker picks the agent; selecting here would skew its rotation
        let served = task
            .agent_type
            .parse::<AgentType>()
            .is_ok_and(|agent_type| self.agents.has_live(agent_type));
        if !served {
            warn!(agent_type = %task.agent_type, "No agent available for task");
            return Err(OrchestrationError::NoAgentFound {
                agent_type: task.agent_type.clone(),
            });
        }

        let trace = self.traces.create(task).await?;
        self.counters.increment(Counter::TotalMessages).await?;

        debug!(
            task_id = %task.message_id,
            agent_type = %task.agent_type,
            trace_id = %trace.trace_id,
            "Routing task"
        );

        match self
            .queues
            .enqueue(AGENT_TASK_QUEUE, task, DEFAULT_JOB_TIMEOUT)
            .await
        {
            Ok(message_id) => {
                // The task is queued; a stale trace must not turn that into an error
                if let Err(e) = self
                    .traces
                    .advance(trace.trace_id, TraceStatus::Routed, Some(message_id), None)
                    .await
                {
                    error!(trace_id = %trace.trace_id, "Failed to mark trace routed: {}", e);
                }
                info!(
                    task_id = %task.message_id,
                    agent_type = %task.agent_type,
                    "Task routed"
                );
                Ok(message_id)
            }
            Err(e) => {
                let err = OrchestrationError::delivery(e);
                let reason = err.to_string();
                error!(task_id = %task.message_id, "Task delivery failed: {}", reason);

                if let Err(e) = self.fail_trace(trace.trace_id, &reason).await {
                    error!(trace_id = %trace.trace_id, "Failed to mark trace failed: {}", e);
                }
                self.dead_letter(task, &reason).await;
                Err(err)
            }
        }
    }

    async fn fail_trace(&self, trace_id: TraceId, reason: &str) -> OrchestrationResult<bool> {
        let advanced = self
            .traces
            .advance(trace_id, TraceStatus::Failed, None, Some(reason))
            .await?;
        if advanced {
            self.counters.increment(Counter::FailedMessages).await?;
        }
        Ok(advanced)
    }

    async fn dead_letter(&self, task: &Task, reason: &str) {
        let letter = DeadLetter::new(task.clone(), reason);
        match self
            .queues
            .enqueue(DEAD_LETTER_QUEUE, &letter, DEFAULT_JOB_TIMEOUT)
            .await
        {
            Ok(_) => warn!(task_id = %task.message_id, "Task moved to dead letter queue"),
            Err(e) => error!(
                task_id = %task.message_id,
                "Failed to dead-letter task: {}", e
            ),
        }
    }

    /// Close the trace of the task `response` answers
    ///
    /// Returns `false` when the task has no trace or the trace is already
    /// closed.
    pub async fn record_response(&self, response: &Response) -> OrchestrationResult<bool> {
        let Some(trace) = self.traces.find_by_task(response.task_id()).await? else {
            debug!(task_id = %response.task_id(), "Response for untraced task");
            return Ok(false);
        };

        match response.error() {
            None => {
                self.traces
                    .advance(trace.trace_id, TraceStatus::Completed, None, None)
                    .await
            }
            Some(reason) => self.fail_trace(trace.trace_id, reason).await,
        }
    }

    /// Consume up to `max` waiting responses, recording each on its trace
    pub async fn drain_responses(&self, max: usize) -> OrchestrationResult<usize> {
        let mut drained = 0;
        while drained < max {
            let Some(job) = self
                .queues
                .dequeue::<Response>(AGENT_RESPONSE_QUEUE, Duration::ZERO)
                .await?
            else {
                break;
            };

            self.record_response(&job.payload).await?;
            self.queues
                .update_message_status(job.message_id(), TaskStatus::Completed, None)
                .await?;
            self.queues.complete_job(&job, JobOutcome::Finished).await?;
            drained += 1;
        }

        if drained > 0 {
            debug!(drained, "Drained responses");
        }
        Ok(drained)
    }

    pub async fn get_message_trace(&self, trace_id: TraceId) -> OrchestrationResult<Option<Trace>> {
        self.traces.get(trace_id).await
    }

    pub async fn trace_for_task(&self, task_id: MessageId) -> OrchestrationResult<Option<Trace>> {
        self.traces.find_by_task(task_id).await
    }

    pub async fn get_trace_statistics(&self) -> OrchestrationResult<TraceStatistics> {
        self.counters.snapshot().await
    }

    /// Up to `limit` dead letters, oldest first
    pub async fn dead_letters(&self, limit: usize) -> OrchestrationResult<Vec<DeadLetter>> {
        self.queues.peek::<DeadLetter>(DEAD_LETTER_QUEUE, limit).await
    }

    /// Shut down every registered agent and empty the registry
    ///
    /// All agents are asked to shut down even if some fail; the first failure
    /// is returned.
    pub async fn shutdown(&self) -> OrchestrationResult<()> {
        let agents = self.agents.drain();
        info!(agents = agents.len(), "Shutting down coordinator");

        let mut first_error = None;
        for agent in agents {
            if let Err(e) = agent.shutdown().await {
                error!(agent_id = %agent.agent_id(), "Agent shutdown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("queues", &self.queues)
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}
