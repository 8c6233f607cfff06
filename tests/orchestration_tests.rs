//! End-to-end behaviour of the orchestration core against the in-memory broker

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use taskmesh::{
    AgentRuntime, AgentType, BrokerError, ConfigManager, Coordinator, EchoAgent, InMemoryBroker,
    OrchestrationError, QueueManager, RuntimeOptions, Task, TraceStatus, into_payload,
};

async fn coordinator_with_echo(broker: &Arc<InMemoryBroker>) -> Coordinator {
    let coordinator = Coordinator::new(QueueManager::new(broker.clone()))
        .await
        .unwrap();
    let echo = AgentRuntime::start(EchoAgent, broker.clone(), RuntimeOptions::default())
        .await
        .unwrap();
    coordinator.register_agent(Arc::new(echo));
    coordinator
}

#[tokio::test]
async fn test_echo_task_is_routed() {
    let broker = Arc::new(InMemoryBroker::new());
    let coordinator = coordinator_with_echo(&broker).await;

    let task = Task::new("Echo", into_payload(json!({"x": 1})));
    let message_id = coordinator.route_task(&task).await.unwrap();

    let trace_id = coordinator
        .trace_for_task(task.message_id)
        .await
        .unwrap()
        .unwrap()
        .trace_id;
    let trace = coordinator.get_message_trace(trace_id).await.unwrap().unwrap();
    assert_eq!(trace.status, TraceStatus::Routed);
    assert_eq!(trace.message_id, Some(message_id));
}

#[tokio::test]
async fn test_unknown_type_with_no_agents() {
    let broker = Arc::new(InMemoryBroker::new());
    let coordinator = Coordinator::new(QueueManager::new(broker.clone()))
        .await
        .unwrap();

    let task = Task::new("Nonexistent", into_payload(json!({})));
    let err = coordinator.route_task(&task).await.unwrap_err();
    assert!(err.to_string().contains("No suitable agent found"));
    assert!(!err.is_retryable());
    assert!(coordinator.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_dead_letters_after_bounded_retries() {
    let broker = Arc::new(InMemoryBroker::new());
    let coordinator = coordinator_with_echo(&broker).await;
    broker.fail_pushes(
        "queue:agent_task",
        BrokerError::Connection("connection refused".to_string()),
        None,
    );

    let task = Task::new("Echo", into_payload(json!({"x": 1})));
    let err = coordinator.route_task(&task).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::DeliveryFailed { .. }));
    assert!(err.should_dead_letter());

    // Default policy: three attempts
    assert_eq!(broker.push_attempts("queue:agent_task"), 3);

    let letters = coordinator.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].task.message_id, task.message_id);
    assert!(!letters[0].error.is_empty());

    let stats = coordinator.get_trace_statistics().await.unwrap();
    assert_eq!(stats.failed_messages, 1);
}

#[tokio::test]
async fn test_config_update_round_trip() {
    let broker = Arc::new(InMemoryBroker::new());
    let dir = TempDir::new().unwrap();
    let configs = ConfigManager::new(broker, dir.path()).await.unwrap();

    let before = configs.load_config("QuizGenerator").await.unwrap();
    configs
        .update_config("QuizGenerator", into_payload(json!({"max_tokens": 500})))
        .await
        .unwrap();
    let after = configs.load_config("QuizGenerator").await.unwrap();

    assert_eq!(after.setting("max_tokens"), Some(&json!(500)));
    assert!(after.updated_at > before.updated_at);
}

fn agent_type_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Echo".to_string()),
        Just("echo".to_string()),
        Just("DocumentAnalyzer".to_string()),
        "[A-Za-z]{1,12}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_routing_outcome_matches_registry(agent_type in agent_type_name(), x in any::<i64>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let broker = Arc::new(InMemoryBroker::new());
            let coordinator = coordinator_with_echo(&broker).await;
            let task = Task::new(agent_type.clone(), into_payload(json!({"x": x})));

            let routable = agent_type.parse::<AgentType>() == Ok(AgentType::Echo);
            match coordinator.route_task(&task).await {
                Ok(_) => {
                    assert!(routable);
                    let trace = coordinator.trace_for_task(task.message_id).await.unwrap().unwrap();
                    assert_eq!(trace.status, TraceStatus::Routed);
                }
                Err(err) => {
                    assert!(!routable);
                    assert!(matches!(err, OrchestrationError::NoAgentFound { .. }));
                    assert!(coordinator.trace_for_task(task.message_id).await.unwrap().is_none());
                }
            }
        });
    }
}
