//! ABOUTME: Orchestration request, task, and result types
//! ABOUTME: Pattern submissions and their wire-visible results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use maestro_agents::AgentType;

/// Composition pattern over tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestrationPattern {
    Sequential,
    Parallel,
    Conditional,
    MapReduce,
}

/// One task in an orchestration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "agentType")]
    pub agent_type: AgentType,
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Inline prompt with `{{var}}` references into the context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Template reference as an alternative to `prompt`
    #[serde(
        rename = "promptTemplateId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_template_id: Option<String>,
    /// Sandboxed condition; used by the conditional pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(id: impl Into<String>, agent_type: AgentType, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            agent_type,
            agent_id: None,
            prompt: Some(prompt.into()),
            prompt_template_id: None,
            condition: None,
            timeout_ms: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// An orchestration submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub pattern: OrchestrationPattern,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Items for the map-reduce pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    #[serde(
        rename = "maxParallel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallel: Option<usize>,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Terminal status of an orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Completed,
    Failed,
}

/// Result of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// Result of an orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub id: String,
    pub status: OrchestrationStatus,
    pub pattern: OrchestrationPattern,
    #[serde(rename = "taskResults")]
    pub task_results: Vec<TaskResult>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
    #[serde(
        rename = "aggregatedResult",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub aggregated_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
