//! ABOUTME: Workflow definition types — steps, inputs, outputs, retry policy
//! ABOUTME: The static shape a client submits; validation lives in validation.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use maestro_agents::AgentType;

/// Exponential-capped retry policy for a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(rename = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    #[serde(rename = "maxDelayMs")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let ms = (self.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Where a step input value comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum InputSource {
    /// A dotted path into the execution context
    Context { path: String },
    /// A prior step's result, optionally a field of it
    Step {
        #[serde(rename = "stepId")]
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// A literal value
    Literal { value: Value },
}

/// Named input bound into the step's prompt variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    #[serde(flatten)]
    pub source: InputSource,
}

/// Where to copy the step result in the context on success
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Context path to write
    pub path: String,
    /// Dotted field of the result to extract; whole result when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// One node of the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(rename = "agentType")]
    pub agent_type: AgentType,
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Exactly one of `prompt_template_id` or `prompt` must be set
    #[serde(
        rename = "promptTemplateId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    #[serde(default)]
    pub outputs: Vec<StepOutput>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Sandboxed condition expression; false skips the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "retryPolicy", default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "continueOnError", default)]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type,
            agent_id: None,
            prompt_template_id: None,
            prompt: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            condition: None,
            retry_policy: None,
            timeout_ms: None,
            continue_on_error: false,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.prompt_template_id = Some(template_id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, source: InputSource) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            source,
        });
        self
    }

    pub fn with_output(mut self, path: impl Into<String>, field: Option<String>) -> Self {
        self.outputs.push(StepOutput {
            path: path.into(),
            field,
        });
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// A workflow DAG as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(
        rename = "defaultRetryPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_retry_policy: Option<RetryPolicy>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(
        rename = "maxParallelSteps",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallel_steps: Option<usize>,
    #[serde(
        rename = "initialContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_context: Option<Value>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            default_retry_policy: None,
            timeout_ms: None,
            max_parallel_steps: None,
            initial_context: None,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(8), Duration::from_millis(350));
    }

    #[test]
    fn test_input_source_serialization() {
        let input = StepInput {
            name: "prev".into(),
            source: InputSource::Step {
                step_id: "a".into(),
                field: Some("text".into()),
            },
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["source"], "step");
        assert_eq!(json["stepId"], "a");

        let back: StepInput = serde_json::from_value(json).unwrap();
        match back.source {
            InputSource::Step { step_id, field } => {
                assert_eq!(step_id, "a");
                assert_eq!(field.as_deref(), Some("text"));
            }
            _ => panic!("wrong source"),
        }
    }
}
