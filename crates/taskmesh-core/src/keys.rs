//! Broker key shapes
//!
//! Every record the orchestration core persists lives under one of these keys.
//! Keep them in one place so workers, coordinators, and operator tooling agree.

use crate::agent_type::AgentType;
use crate::ids::{AgentId, MessageId, TraceId};

/// Global trace counters hash (`total_messages`, `failed_messages`)
pub const MESSAGE_TRACE: &str = "message_trace";

/// Hash mapping task ids to their trace ids
pub const TRACE_INDEX: &str = "trace_index";

/// Hash with bookkeeping timestamps for the configuration store
pub const AGENT_CONFIGS: &str = "agent_configs";

/// Glob matching every per-type configuration hash
pub const AGENT_CONFIG_PATTERN: &str = "agent_config:*";

/// Persisted lifecycle state of one agent runtime
pub fn agent_state(agent_id: &AgentId) -> String {
    format!("agent:{}:state", agent_id)
}

/// Status record of a queued message
pub fn message(message_id: &MessageId) -> String {
    format!("message:{}", message_id)
}

/// Trace record
pub fn trace(trace_id: &TraceId) -> String {
    format!("trace:{}", trace_id)
}

/// Stored configuration of one agent type
pub fn agent_config(agent_type: AgentType) -> String {
    format!("agent_config:{}", agent_type)
}

/// Pub/sub channel announcing configuration changes for one agent type
pub fn config_change(agent_type: AgentType) -> String {
    format!("config_change:{}", agent_type)
}

/// Job list of a named queue
pub fn queue(name: &str) -> String {
    format!("queue:{}", name)
}

/// Started/finished/failed job registry of a named queue
pub fn queue_registry(name: &str) -> String {
    format!("queue:{}:registry", name)
}
