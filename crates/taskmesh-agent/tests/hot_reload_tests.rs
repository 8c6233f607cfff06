//! Hot reload of agent configuration through the broker's change channel

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use taskmesh_agent::{
    AgentRuntime, ConfigHandle, ConfigManager, EchoAgent, ManagedAgent, RuntimeOptions,
};
use taskmesh_broker::InMemoryBroker;
use taskmesh_core::into_payload;

#[tokio::test]
async fn test_running_agent_sees_config_updates() {
    let broker = Arc::new(InMemoryBroker::new());
    let dir = TempDir::new().unwrap();
    let configs = ConfigManager::new(broker.clone(), dir.path()).await.unwrap();

    let live = configs.watch("Echo").await.unwrap();
    let runtime = AgentRuntime::start(
        EchoAgent,
        broker.clone(),
        RuntimeOptions::default().with_config(ConfigHandle::Live(live)),
    )
    .await
    .unwrap();
    assert_eq!(runtime.config().timeout, 3600);

    configs
        .update_config("Echo", into_payload(json!({"timeout": 600, "max_tokens": 256})))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runtime.config().timeout != 600 {
        assert!(tokio::time::Instant::now() < deadline, "update never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = runtime.get_health_status();
    assert_eq!(status.config.setting("max_tokens"), Some(&json!(256)));
}

#[tokio::test]
async fn test_file_store_survives_broker_loss() {
    let dir = TempDir::new().unwrap();

    let first = ConfigManager::new(Arc::new(InMemoryBroker::new()), dir.path())
        .await
        .unwrap();
    let updated = first
        .update_config("DocumentAnalyzer", into_payload(json!({"retry_delay": 5})))
        .await
        .unwrap();

    // A fresh broker has no cached copy; the YAML file is the source
    let second = ConfigManager::new(Arc::new(InMemoryBroker::new()), dir.path())
        .await
        .unwrap();
    let reloaded = second.load_config("document_analyzer").await.unwrap();
    assert_eq!(reloaded.retry_delay, 5);
    assert_eq!(reloaded.updated_at, updated.updated_at);
}
