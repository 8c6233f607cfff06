//! Enumerated agent types
//!
//! Tasks arrive from external producers carrying a free-form type name. Routing
//! resolves that name into one of the known [`AgentType`] variants; names that
//! do not resolve cannot be served by any agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of agents the orchestration core can route to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentType {
    DocumentAnalyzer,
    ModulePlanner,
    ContentGenerator,
    QuizGenerator,
    QualityAssurance,
    /// Returns the task data unchanged; used for smoke tests and health probes
    Echo,
}

impl AgentType {
    /// Every variant, in declaration order
    pub const ALL: [AgentType; 6] = [
        AgentType::DocumentAnalyzer,
        AgentType::ModulePlanner,
        AgentType::ContentGenerator,
        AgentType::QuizGenerator,
        AgentType::QualityAssurance,
        AgentType::Echo,
    ];

    /// Canonical name as it appears in tasks and broker keys
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::DocumentAnalyzer => "DocumentAnalyzer",
            AgentType::ModulePlanner => "ModulePlanner",
            AgentType::ContentGenerator => "ContentGenerator",
            AgentType::QuizGenerator => "QuizGenerator",
            AgentType::QualityAssurance => "QualityAssurance",
            AgentType::Echo => "Echo",
        }
    }

    /// Snake-case form, used for configuration file names
    pub fn file_stem(&self) -> &'static str {
        match self {
            AgentType::DocumentAnalyzer => "document_analyzer",
            AgentType::ModulePlanner => "module_planner",
            AgentType::ContentGenerator => "content_generator",
            AgentType::QuizGenerator => "quiz_generator",
            AgentType::QualityAssurance => "quality_assurance",
            AgentType::Echo => "echo",
        }
    }
}

/// Returned when a type name matches no known agent type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent type: {0}")]
pub struct UnknownAgentType(pub String);

impl FromStr for AgentType {
    type Err = UnknownAgentType;

    /// Accepts the canonical PascalCase name or its snake_case form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.file_stem() == s)
            .ok_or_else(|| UnknownAgentType(s.to_string()))
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
