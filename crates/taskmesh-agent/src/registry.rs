//! In-memory registry of running agents
//!
//! Agents are kept in registration order. When several live agents share a
//! type, [`AgentRegistry::select`] hands tasks to them round-robin; agents in
//! the `shutdown` state are never selected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use taskmesh_core::{AgentId, AgentType};

use crate::runtime::ManagedAgent;

/// Registered agents keyed by id, in registration order
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<Vec<Arc<dyn ManagedAgent>>>,
    cursors: Mutex<HashMap<AgentType, usize>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent
    ///
    /// An agent with the same id is replaced in place and returned.
    pub fn register(&self, agent: Arc<dyn ManagedAgent>) -> Option<Arc<dyn ManagedAgent>> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        match agents.iter().position(|a| a.agent_id() == agent.agent_id()) {
            Some(index) => Some(std::mem::replace(&mut agents[index], agent)),
            None => {
                agents.push(agent);
                None
            }
        }
    }

    /// Remove an agent by id
    pub fn unregister(&self, agent_id: &AgentId) -> Option<Arc<dyn ManagedAgent>> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let index = agents.iter().position(|a| a.agent_id() == agent_id)?;
        Some(agents.remove(index))
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<dyn ManagedAgent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.agent_id() == agent_id)
            .cloned()
    }

    /// Whether some live agent serves `agent_type`
    ///
    /// Unlike [`AgentRegistry::select`] this leaves the round-robin cursor
    /// where it is.
    pub fn has_live(&self, agent_type: AgentType) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|a| a.agent_type() == agent_type && !a.state().is_shutdown())
    }

    /// Next live agent of `agent_type`, round-robin
    pub fn select(&self, agent_type: AgentType) -> Option<Arc<dyn ManagedAgent>> {
        let candidates: Vec<Arc<dyn ManagedAgent>> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.agent_type() == agent_type && !a.state().is_shutdown())
            .cloned()
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(agent_type).or_insert(0);
        let chosen = Arc::clone(&candidates[*cursor % candidates.len()]);
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }

    /// Every registered agent, in registration order
    pub fn agents(&self) -> Vec<Arc<dyn ManagedAgent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Remove and return every agent
    pub fn drain(&self) -> Vec<Arc<dyn ManagedAgent>> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *agents)
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
