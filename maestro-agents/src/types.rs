//! ABOUTME: Agent record, type, and status definitions
//! ABOUTME: Serde shapes persisted under agent:registry:* keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of external callable an agent wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// LLM command-line tool
    Llm,
    /// Audio synthesis worker
    Synth,
    /// Anything else registered by the host application
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Llm => "llm",
            AgentType::Synth => "synth",
            AgentType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(AgentType::Llm),
            "synth" => Some(AgentType::Synth),
            "custom" => Some(AgentType::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operational status of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    /// Whether the agent accepts executions
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

/// A registered agent as seen by callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    #[serde(rename = "errorCount", default)]
    pub error_count: u32,
    #[serde(
        rename = "lastHealthCheck",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}
