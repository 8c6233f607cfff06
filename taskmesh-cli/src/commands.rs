use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use taskmesh_agent::{
    AgentRegistry, AgentRuntime, ConfigHandle, ConfigManager, EchoAgent, ManagedAgent,
    RuntimeOptions, Worker,
};
use taskmesh_broker::{Broker, BrokerConfig, RedisBroker};
use taskmesh_coordinator::{Coordinator, TraceStatistics};
use taskmesh_core::{AgentId, AgentType, MessageId, Payload, Task};
use taskmesh_queue::{QueueManager, QueueStats};

use crate::error::{CliError, CliResult};

async fn connect() -> CliResult<Arc<dyn Broker>> {
    let config = BrokerConfig::from_env()?;
    info!(pool_size = config.pool_size, "Connecting to broker");
    let broker = RedisBroker::with_config(config).await?;
    Ok(Arc::new(broker))
}

/// Agents served by `taskmesh worker`
///
/// Submission routes against the same roster, so a task is only accepted for
/// a type some worker can run.
async fn deployment_roster(
    broker: &Arc<dyn Broker>,
    agent_id: Option<AgentId>,
    config: Option<ConfigHandle>,
) -> CliResult<Vec<Arc<dyn ManagedAgent>>> {
    let mut options = RuntimeOptions::default();
    if let Some(agent_id) = agent_id {
        options = options.with_agent_id(agent_id);
    }
    if let Some(config) = config {
        options = options.with_config(config);
    }

    let echo = AgentRuntime::start(EchoAgent, Arc::clone(broker), options).await?;
    Ok(vec![Arc::new(echo)])
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_worker(poll_interval: Duration) -> CliResult<()> {
    let broker = connect().await?;
    let queues = QueueManager::new(Arc::clone(&broker));
    let configs = ConfigManager::from_env(Arc::clone(&broker)).await?;
    let live = configs.watch(AgentType::Echo.as_str()).await?;

    let agents = Arc::new(AgentRegistry::new());
    for agent in deployment_roster(&broker, None, Some(ConfigHandle::Live(live))).await? {
        info!(agent_id = %agent.agent_id(), agent_type = %agent.agent_type(), "Serving agent");
        agents.register(agent);
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = stop.send(true);
    });

    let worker = Worker::new(queues, Arc::clone(&agents)).with_poll_interval(poll_interval);
    worker.run(shutdown).await?;

    for agent in agents.drain() {
        agent.shutdown().await?;
    }
    Ok(())
}

#[derive(Serialize)]
struct Submitted {
    task_id: MessageId,
    message_id: MessageId,
}

pub async fn submit(agent_type: &str, data: &str) -> CliResult<()> {
    let task = Task::new(agent_type, parse_task_data(data)?);

    let broker = connect().await?;
    let coordinator = Coordinator::new(QueueManager::new(Arc::clone(&broker))).await?;
    let submitter = AgentId::parse("taskmesh-cli-echo")
        .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
    for agent in deployment_roster(&broker, Some(submitter), None).await? {
        coordinator.register_agent(agent);
    }

    let routed = coordinator.route_task(&task).await;
    coordinator.shutdown().await?;
    let message_id = routed?;

    print_json(&Submitted {
        task_id: task.message_id,
        message_id,
    })
}

#[derive(Serialize)]
struct StatsReport {
    traces: TraceStatistics,
    queues: BTreeMap<String, QueueStats>,
}

pub async fn stats() -> CliResult<()> {
    let broker = connect().await?;
    let coordinator = Coordinator::new(QueueManager::new(broker)).await?;

    print_json(&StatsReport {
        traces: coordinator.get_trace_statistics().await?,
        queues: coordinator.queues().get_queue_stats().await?,
    })
}

pub async fn trace(task_id: &str) -> CliResult<()> {
    let task_id: MessageId = task_id
        .parse()
        .map_err(|e| CliError::InvalidArgument(format!("task id '{task_id}': {e}")))?;

    let broker = connect().await?;
    let coordinator = Coordinator::new(QueueManager::new(broker)).await?;
    match coordinator.trace_for_task(task_id).await? {
        Some(trace) => print_json(&trace),
        None => Err(CliError::NotFound(format!(
            "No trace recorded for task {task_id}"
        ))),
    }
}

pub async fn dead_letters(limit: usize) -> CliResult<()> {
    let broker = connect().await?;
    let coordinator = Coordinator::new(QueueManager::new(broker)).await?;
    print_json(&coordinator.dead_letters(limit).await?)
}

pub async fn config_show(agent_type: &str) -> CliResult<()> {
    let broker = connect().await?;
    let configs = ConfigManager::from_env(broker).await?;
    let config = configs.load_config(agent_type).await?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

pub async fn config_set(agent_type: &str, settings: &[String]) -> CliResult<()> {
    if settings.is_empty() {
        return Err(CliError::InvalidArgument(
            "expected at least one key=value setting".to_string(),
        ));
    }
    let mut updates = Payload::new();
    for setting in settings {
        let (key, value) = parse_setting(setting)?;
        updates.insert(key, value);
    }

    let broker = connect().await?;
    let configs = ConfigManager::from_env(broker).await?;
    let config = configs.update_config(agent_type, updates).await?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn parse_task_data(data: &str) -> CliResult<Payload> {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CliError::InvalidArgument(
            "task data must be a JSON object".to_string(),
        )),
        Err(e) => Err(CliError::InvalidArgument(format!("task data: {e}"))),
    }
}

/// `key=value`, where the value is read as JSON when it parses and as a plain
/// string otherwise
fn parse_setting(setting: &str) -> CliResult<(String, Value)> {
    let (key, raw) = setting
        .split_once('=')
        .ok_or_else(|| CliError::InvalidArgument(format!("'{setting}' is not key=value")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidArgument(format!(
            "'{setting}' has an empty key"
        )));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
