//! ABOUTME: Agent execution contracts shared across the engine
//! ABOUTME: Defines AgentExecutionInput/Output and the AgentExecutor trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::Result;
use crate::types::ExecutionId;

/// Caller context threaded through every agent invocation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentContext {
    /// User on whose behalf the call runs
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Execution the call belongs to, when any
    #[serde(rename = "executionId", skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    /// Free-form context values visible to the executor
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl AgentContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            execution_id: None,
            values: Map::new(),
        }
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// Input to a single agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionInput {
    /// Fully rendered prompt
    pub prompt: String,
    /// Caller context
    pub context: AgentContext,
    /// Executor-specific configuration (model, voice, flags, ...)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    /// Hard deadline for this call; executors must not outlive it
    #[serde(rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl AgentExecutionInput {
    pub fn new(prompt: impl Into<String>, context: AgentContext) -> Self {
        Self {
            prompt: prompt.into(),
            context,
            config: Value::Null,
            timeout_ms: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Timeout as a Duration, when set
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Output of a single agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentExecutionOutput {
    /// Successful output wrapping a result value
    pub fn success(result: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
            metadata: Map::new(),
        }
    }

    /// Failed output carrying an error message
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Result as text, for prompt threading between steps
    pub fn result_text(&self) -> String {
        match &self.result {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// An external callable registered with the agent registry.
///
/// Implementations wrap an LLM CLI, a synthesis worker, or any custom
/// backend. `execute` must honor the input timeout; `probe` is the health
/// check the registry runs periodically.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one invocation
    async fn execute(&self, input: AgentExecutionInput) -> Result<AgentExecutionOutput>;

    /// Cheap liveness probe; an Err marks the agent unhealthy
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Capability tags advertised to the registry
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_builder() {
        let input = AgentExecutionInput::new("hello", AgentContext::for_user("u1"))
            .with_config(serde_json::json!({"model": "large"}))
            .with_timeout(Duration::from_secs(30));
        assert_eq!(input.prompt, "hello");
        assert_eq!(input.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(input.config["model"], "large");
    }

    #[test]
    fn test_output_result_text() {
        let out = AgentExecutionOutput::success(serde_json::json!("plain"), 10);
        assert_eq!(out.result_text(), "plain");

        let out = AgentExecutionOutput::success(serde_json::json!({"k": 1}), 10);
        assert_eq!(out.result_text(), "{\"k\":1}");

        let out = AgentExecutionOutput::failure("boom", 5);
        assert_eq!(out.result_text(), "");
        assert!(!out.success);
    }

    #[test]
    fn test_serialization_field_names() {
        let input = AgentExecutionInput::new("p", AgentContext::for_user("u"))
            .with_timeout(Duration::from_millis(500));
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["timeoutMs"], 500);
        assert_eq!(json["context"]["userId"], "u");
    }
}
