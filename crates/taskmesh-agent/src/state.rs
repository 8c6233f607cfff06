//! Agent lifecycle state and health metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of one agent runtime
///
/// `Idle` is initial. `Processing` is held only while a task is being handled,
/// `Error` only until the failure has been recorded, and `Shutdown` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Processing,
    Error,
    Shutdown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Processing => "processing",
            AgentState::Error => "error",
            AgentState::Shutdown => "shutdown",
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, AgentState::Shutdown)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent counters, updated after every task attempt
///
/// Counters only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub start_time: DateTime<Utc>,
    pub tasks_processed: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            tasks_processed: 0,
            errors: 0,
            last_error: None,
            last_error_time: None,
            last_success: None,
        }
    }
}

impl HealthMetrics {
    pub fn record_success(&mut self) {
        self.tasks_processed += 1;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(error.into());
        self.last_error_time = Some(Utc::now());
    }

    /// Time since the runtime started, to whole seconds
    pub fn uptime(&self) -> Duration {
        let elapsed = Utc::now()
            .signed_duration_since(self.start_time)
            .to_std()
            .unwrap_or_default();
        Duration::from_secs(elapsed.as_secs())
    }
}
