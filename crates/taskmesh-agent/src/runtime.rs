//! Agent runtime state machine
//!
//! ```text
//! idle --handle_task--> processing --ok--> idle
//!                            \--err--> error --recorded--> idle
//! any --shutdown--> shutdown (terminal)
//! ```
//!
//! The runtime owns the state and health metrics of one agent instance and
//! persists them to `agent:<id>:state` on every transition. Agents only
//! implement [`Agent::process_task`].

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{error, info, warn};

use taskmesh_broker::Broker;
use taskmesh_core::{
    AgentId, AgentType, OrchestrationError, OrchestrationResult, Response, RetryPolicy, Task, keys,
};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::state::{AgentState, HealthMetrics};

/// Read-only view of an agent's configuration
#[derive(Debug, Clone)]
pub enum ConfigHandle {
    /// Fixed at start-up
    Static(AgentConfig),
    /// Kept current by [`ConfigManager::watch`](crate::ConfigManager::watch)
    Live(watch::Receiver<AgentConfig>),
}

impl ConfigHandle {
    /// Current configuration
    pub fn snapshot(&self) -> AgentConfig {
        match self {
            ConfigHandle::Static(config) => config.clone(),
            ConfigHandle::Live(receiver) => receiver.borrow().clone(),
        }
    }
}

/// Start-up options for an [`AgentRuntime`]
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Random when not given
    pub agent_id: Option<AgentId>,
    /// Defaults to the agent type's default configuration
    pub config: Option<ConfigHandle>,
    /// Retry policy for state persistence
    pub retry: RetryPolicy,
}

impl RuntimeOptions {
    pub fn with_agent_id(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub state: AgentState,
    pub health_metrics: HealthMetrics,
    pub config: AgentConfig,
    /// Human-readable uptime, e.g. `1h 2m 5s`
    pub uptime: String,
}

/// Object-safe view of a running agent, held by registries and workers
#[async_trait]
pub trait ManagedAgent: Send + Sync {
    fn agent_id(&self) -> &AgentId;

    fn agent_type(&self) -> AgentType;

    fn state(&self) -> AgentState;

    /// Process one task through the state machine
    ///
    /// Whatever happens inside the agent, the state is back to `idle` when this
    /// returns (or `shutdown`, if shutdown raced the call).
    async fn handle_task(&self, task: &Task) -> OrchestrationResult<Response>;

    fn get_health_status(&self) -> HealthStatus;

    /// Move to the terminal `shutdown` state
    async fn shutdown(&self) -> OrchestrationResult<()>;
}

struct Lifecycle {
    state: AgentState,
    metrics: HealthMetrics,
}

/// Hosts one [`Agent`] behind the uniform lifecycle
pub struct AgentRuntime<A> {
    agent_id: AgentId,
    agent_type: AgentType,
    agent: A,
    broker: Arc<dyn Broker>,
    config: ConfigHandle,
    retry: RetryPolicy,
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole of `handle_task`, one task at a time
    busy: tokio::sync::Mutex<()>,
}

impl<A: Agent> AgentRuntime<A> {
    /// Start a runtime and persist its initial `idle` state
    pub async fn start(
        agent: A,
        broker: Arc<dyn Broker>,
        options: RuntimeOptions,
    ) -> OrchestrationResult<Self> {
        let agent_type = agent.agent_type();
        let config = options
            .config
            .unwrap_or_else(|| ConfigHandle::Static(AgentConfig::new(agent_type)));

        let runtime = Self {
            agent_id: options.agent_id.unwrap_or_else(AgentId::generate),
            agent_type,
            agent,
            broker,
            config,
            retry: options.retry,
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Idle,
                metrics: HealthMetrics::default(),
            }),
            busy: tokio::sync::Mutex::new(()),
        };

        let mut fields = runtime.state_fields();
        fields.push(("agent_id", runtime.agent_id.to_string()));
        fields.push(("agent_type", agent_type.to_string()));
        fields.push(("config", serde_json::to_string(&runtime.config.snapshot())?));
        runtime.write_state(&fields).await?;

        info!(agent_id = %runtime.agent_id, agent_type = %agent_type, "Agent started");
        Ok(runtime)
    }

    /// The hosted processing logic
    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Current configuration snapshot
    pub fn config(&self) -> AgentConfig {
        self.config.snapshot()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // A poisoned lock still holds a consistent state machine
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: AgentState) {
        self.lifecycle().state = state;
    }

    fn state_fields(&self) -> Vec<(&'static str, String)> {
        let lifecycle = self.lifecycle();
        let metrics = serde_json::to_string(&lifecycle.metrics).unwrap_or_else(|_| "{}".into());
        vec![
            ("state", lifecycle.state.as_str().to_string()),
            ("last_updated", Utc::now().to_rfc3339()),
            ("health_metrics", metrics),
        ]
    }

    async fn write_state(&self, fields: &[(&'static str, String)]) -> OrchestrationResult<()> {
        let broker = &self.broker;
        let key = keys::agent_state(&self.agent_id);
        let key = key.as_str();
        self.retry
            .run("persist_agent_state", move || async move {
                broker.hset(key, fields).await
            })
            .await?;
        Ok(())
    }

    /// Persist the current state; failures are logged, never raised
    async fn persist(&self) {
        let fields = self.state_fields();
        if let Err(e) = self.write_state(&fields).await {
            warn!(agent_id = %self.agent_id, "Failed to persist agent state: {}", e);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle().state.is_shutdown()
    }

    async fn run_task(&self, task: &Task) -> OrchestrationResult<Response> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state.is_shutdown() {
                return Err(OrchestrationError::AgentShutdown {
                    agent_id: self.agent_id.clone(),
                });
            }
            lifecycle.state = AgentState::Processing;
        }
        let mut guard = ProcessingGuard {
            runtime: self,
            armed: true,
        };
        self.persist().await;

        let outcome = AssertUnwindSafe(self.agent.process_task(task))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(response)) => {
                self.lifecycle().metrics.record_success();
                info!(
                    agent_id = %self.agent_id,
                    task_id = %task.message_id,
                    "Task processed"
                );
                Ok(response)
            }
            Ok(Err(e)) => Err(self.record_failure(task, e.to_string()).await),
            Err(panic) => Err(self.record_failure(task, panic_message(panic)).await),
        };

        guard.armed = false;
        if !self.is_shutdown() {
            self.set_state(AgentState::Idle);
        }
        self.persist().await;
        result
    }

    async fn record_failure(&self, task: &Task, cause: String) -> OrchestrationError {
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.metrics.record_failure(cause.clone());
            if !lifecycle.state.is_shutdown() {
                lifecycle.state = AgentState::Error;
            }
        }
        self.persist().await;

        error!(
            agent_id = %self.agent_id,
            task_id = %task.message_id,
            "Task processing failed: {}", cause
        );
        OrchestrationError::ProcessingFailed {
            agent_id: self.agent_id.clone(),
            cause,
        }
    }

    /// The task future was dropped mid-flight
    fn abandon(&self) {
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                AgentState::Processing => {
                    lifecycle
                        .metrics
                        .record_failure("task cancelled before completion");
                }
                // The failure was already recorded
                AgentState::Error => {}
                AgentState::Idle | AgentState::Shutdown => return,
            }
            lifecycle.state = AgentState::Idle;
        }
        warn!(agent_id = %self.agent_id, "Task cancelled before completion");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broker = Arc::clone(&self.broker);
        let key = keys::agent_state(&self.agent_id);
        let fields = self.state_fields();
        handle.spawn(async move {
            if let Err(e) = broker.hset(&key, &fields).await {
                warn!(key = %key, "Failed to persist agent state: {}", e);
            }
        });
    }
}

/// Resets the state machine when `handle_task` is cancelled (e.g. by a job
/// timeout) before it could do so itself
struct ProcessingGuard<'a, A: Agent> {
    runtime: &'a AgentRuntime<A>,
    armed: bool,
}

impl<A: Agent> Drop for ProcessingGuard<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            self.runtime.abandon();
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("agent panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("agent panicked: {message}")
    } else {
        "agent panicked".to_string()
    }
}

#[async_trait]
impl<A: Agent> ManagedAgent for AgentRuntime<A> {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn state(&self) -> AgentState {
        self.lifecycle().state
    }

    async fn handle_task(&self, task: &Task) -> OrchestrationResult<Response> {
        let _busy = self.busy.lock().await;
        self.run_task(task).await
    }

    fn get_health_status(&self) -> HealthStatus {
        let (state, health_metrics) = {
            let lifecycle = self.lifecycle();
            (lifecycle.state, lifecycle.metrics.clone())
        };
        HealthStatus {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type,
            state,
            uptime: humantime::format_duration(health_metrics.uptime()).to_string(),
            health_metrics,
            config: self.config.snapshot(),
        }
    }

    async fn shutdown(&self) -> OrchestrationResult<()> {
        self.set_state(AgentState::Shutdown);
        let fields = self.state_fields();
        self.write_state(&fields).await?;
        info!(agent_id = %self.agent_id, "Agent shutting down");
        Ok(())
    }
}
