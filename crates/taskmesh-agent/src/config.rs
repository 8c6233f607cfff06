//! Per-agent-type configuration with hot reload
//!
//! [`ConfigManager::load_config`] reads the broker first, then the YAML file
//! store, and finally synthesizes a default. Every save writes both stores.
//! Updates are announced on `config_change:<type>`; runtimes that want live
//! configuration subscribe themselves (see [`ConfigManager::watch`]).
//!
//! ## Environment Variables
//!
//! - `TASKMESH_CONFIG_DIR` - Directory of the YAML file store (default: `config`)

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskmesh_broker::Broker;
use taskmesh_core::{
    AgentType, BrokerResult, OrchestrationError, OrchestrationResult, Payload, RetryPolicy, keys,
};

/// Log verbosity accepted in agent configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Closest `tracing` level; critical maps to error
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

fn default_timeout() -> u64 {
    3600
}

fn default_log_level() -> String {
    LogLevel::Info.as_str().to_string()
}

/// Versioned configuration for one agent type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 1..=10
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds, 1..=60
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Seconds, 60..=7200
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// One of DEBUG, INFO, WARNING, ERROR, CRITICAL
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Agent-specific settings such as `max_tokens`
    #[serde(flatten)]
    pub extra: Payload,
}

impl AgentConfig {
    /// Default configuration for `agent_type`
    pub fn new(agent_type: AgentType) -> Self {
        let now = Utc::now();
        Self {
            agent_id: format!("{}_{}", agent_type.file_stem(), now.timestamp_micros()),
            agent_type: agent_type.as_str().to_string(),
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
            log_level: default_log_level(),
            created_at: now,
            updated_at: now,
            extra: Payload::new(),
        }
    }

    /// Describe the first rule this configuration breaks
    pub fn check(&self) -> Result<(), String> {
        if self.agent_id.is_empty() {
            return Err("agent_id cannot be empty".to_string());
        }
        if self.agent_type.is_empty() {
            return Err("agent_type cannot be empty".to_string());
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(format!(
                "max_retries must be between 1 and 10, got {}",
                self.max_retries
            ));
        }
        if !(1..=60).contains(&self.retry_delay) {
            return Err(format!(
                "retry_delay must be between 1 and 60 seconds, got {}",
                self.retry_delay
            ));
        }
        if !(60..=7200).contains(&self.timeout) {
            return Err(format!(
                "timeout must be between 60 and 7200 seconds, got {}",
                self.timeout
            ));
        }
        self.log_level.parse::<LogLevel>()?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    pub fn level(&self) -> Option<LogLevel> {
        self.log_level.parse().ok()
    }

    /// Retry policy described by `max_retries` and `retry_delay`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Agent-specific setting by name
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Notification published on `config_change:<type>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub agent_type: String,
    pub config: AgentConfig,
    pub timestamp: DateTime<Utc>,
}

/// Stream of configuration changes for one agent type
pub type ConfigChangeStream = Pin<Box<dyn Stream<Item = ConfigChange> + Send + 'static>>;

/// Loads, validates, persists, and announces agent configuration
pub struct ConfigManager {
    broker: Arc<dyn Broker>,
    config_dir: PathBuf,
    retry: RetryPolicy,
}

impl ConfigManager {
    /// Create a manager storing files under `config_dir`
    ///
    /// Creates the directory and the `agent_configs` bookkeeping hash when
    /// missing.
    pub async fn new(
        broker: Arc<dyn Broker>,
        config_dir: impl Into<PathBuf>,
    ) -> OrchestrationResult<Self> {
        let manager = Self {
            broker,
            config_dir: config_dir.into(),
            retry: RetryPolicy::default(),
        };
        tokio::fs::create_dir_all(&manager.config_dir).await?;

        if !manager.broker.exists(keys::AGENT_CONFIGS).await? {
            let now = Utc::now().to_rfc3339();
            manager
                .broker
                .hset(
                    keys::AGENT_CONFIGS,
                    &[("created_at", now.clone()), ("last_updated", now)],
                )
                .await?;
        }

        Ok(manager)
    }

    /// Create a manager whose file store lives in `TASKMESH_CONFIG_DIR`
    pub async fn from_env(broker: Arc<dyn Broker>) -> OrchestrationResult<Self> {
        let dir = std::env::var("TASKMESH_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::new(broker, dir).await
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn config_file(&self, agent_type: AgentType) -> PathBuf {
        self.config_dir
            .join(format!("{}.yaml", agent_type.file_stem()))
    }

    /// Configuration for `agent_type`: broker, then file, then a saved default
    pub async fn load_config(&self, agent_type: &str) -> OrchestrationResult<AgentConfig> {
        let agent_type: AgentType = agent_type.parse()?;
        self.load(agent_type).await
    }

    async fn load(&self, agent_type: AgentType) -> OrchestrationResult<AgentConfig> {
        let key = keys::agent_config(agent_type);
        if let Some(raw) = self.broker.hget(&key, "config").await? {
            return Ok(serde_json::from_str(&raw)?);
        }

        let path = self.config_file(agent_type);
        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let config: AgentConfig = serde_yaml::from_str(&raw).map_err(|e| {
                OrchestrationError::InvalidConfig(format!("{}: {}", path.display(), e))
            })?;
            config.check().map_err(|reason| {
                OrchestrationError::InvalidConfig(format!("{}: {}", path.display(), reason))
            })?;
            debug!(agent_type = %agent_type, "Loaded configuration from file");
            self.save(agent_type, &config).await?;
            return Ok(config);
        }

        let config = AgentConfig::new(agent_type);
        info!(agent_type = %agent_type, "Created default configuration");
        self.save(agent_type, &config).await?;
        Ok(config)
    }

    async fn save(&self, agent_type: AgentType, config: &AgentConfig) -> OrchestrationResult<()> {
        let json = serde_json::to_string(config)?;
        let yaml = serde_yaml::to_string(config)
            .map_err(|e| OrchestrationError::Serialization(e.to_string()))?;

        let broker = &self.broker;
        let key = keys::agent_config(agent_type);
        let key = key.as_str();
        let fields = [("config", json), ("updated_at", Utc::now().to_rfc3339())];
        let fields = fields.as_slice();
        self.retried("save_config", move || async move {
            broker.hset(key, fields).await
        })
        .await?;

        tokio::fs::write(self.config_file(agent_type), yaml).await?;

        let stamp = [("last_updated", Utc::now().to_rfc3339())];
        let stamp = stamp.as_slice();
        self.retried("save_config", move || async move {
            broker.hset(keys::AGENT_CONFIGS, stamp).await
        })
        .await?;
        Ok(())
    }

    async fn retried<T, F, Fut>(&self, operation: &str, op: F) -> OrchestrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = BrokerResult<T>>,
    {
        Ok(self.retry.run(operation, op).await?)
    }

    /// Merge `updates` into the current configuration and announce the change
    ///
    /// The merged configuration is validated before anything is written.
    /// Unknown keys are kept as agent-specific settings.
    pub async fn update_config(
        &self,
        agent_type: &str,
        updates: Payload,
    ) -> OrchestrationResult<AgentConfig> {
        let agent_type: AgentType = agent_type.parse()?;
        let current = self.load(agent_type).await?;

        let mut merged = match serde_json::to_value(&current)? {
            Value::Object(map) => map,
            _ => {
                return Err(OrchestrationError::Serialization(
                    "configuration is not an object".to_string(),
                ));
            }
        };
        merged.extend(updates);

        let mut updated: AgentConfig = serde_json::from_value(Value::Object(merged))
            .map_err(|e| OrchestrationError::InvalidConfig(e.to_string()))?;
        if updated.agent_type != agent_type.as_str() {
            return Err(OrchestrationError::InvalidConfig(format!(
                "agent_type cannot change from {} to {}",
                agent_type, updated.agent_type
            )));
        }
        updated.check().map_err(OrchestrationError::InvalidConfig)?;
        updated.updated_at = next_timestamp(current.updated_at);

        self.save(agent_type, &updated).await?;
        self.notify_config_change(agent_type, &updated).await?;

        info!(agent_type = %agent_type, "Updated configuration");
        Ok(updated)
    }

    async fn notify_config_change(
        &self,
        agent_type: AgentType,
        config: &AgentConfig,
    ) -> OrchestrationResult<()> {
        let change = ConfigChange {
            agent_type: agent_type.as_str().to_string(),
            config: config.clone(),
            timestamp: Utc::now(),
        };
        let receivers = self
            .broker
            .publish(
                &keys::config_change(agent_type),
                serde_json::to_string(&change)?,
            )
            .await?;
        debug!(agent_type = %agent_type, receivers, "Published configuration change");
        Ok(())
    }

    /// Every stored configuration, keyed by agent type
    pub async fn get_all_configs(&self) -> OrchestrationResult<BTreeMap<AgentType, AgentConfig>> {
        let mut configs = BTreeMap::new();
        for key in self.broker.keys(keys::AGENT_CONFIG_PATTERN).await? {
            let Some(name) = key.split(':').nth(1) else {
                continue;
            };
            match name.parse::<AgentType>() {
                Ok(agent_type) => {
                    configs.insert(agent_type, self.load(agent_type).await?);
                }
                Err(e) => warn!(key = %key, "Ignoring configuration: {}", e),
            }
        }
        Ok(configs)
    }

    /// Pure validation; `false` rather than an error for invalid input
    pub fn validate_config(&self, config: &AgentConfig) -> bool {
        match config.check() {
            Ok(()) => true,
            Err(reason) => {
                debug!(agent_type = %config.agent_type, "Configuration rejected: {}", reason);
                false
            }
        }
    }

    /// Changes published for `agent_type` from now on
    pub async fn subscribe(&self, agent_type: &str) -> OrchestrationResult<ConfigChangeStream> {
        let agent_type: AgentType = agent_type.parse()?;
        let payloads = self
            .broker
            .subscribe(&keys::config_change(agent_type))
            .await?;

        let changes = payloads.filter_map(|raw| async move {
            match serde_json::from_str::<ConfigChange>(&raw) {
                Ok(change) => Some(change),
                Err(e) => {
                    warn!("Dropping malformed configuration change: {}", e);
                    None
                }
            }
        });
        Ok(Box::pin(changes))
    }

    /// A receiver that always holds the latest configuration of `agent_type`
    ///
    /// A background task follows the change channel until every receiver is
    /// dropped.
    pub async fn watch(&self, agent_type: &str) -> OrchestrationResult<watch::Receiver<AgentConfig>> {
        let mut changes = self.subscribe(agent_type).await?;
        let current = self.load_config(agent_type).await?;
        let (sender, receiver) = watch::channel(current);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    change = changes.next() => match change {
                        Some(change) => {
                            if sender.send(change.config).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(receiver)
    }
}

/// `now`, or just after `previous` when the clock has not moved past it
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}
