//! ABOUTME: SelfCritiqueService — iterative execute/evaluate/improve loop
//! ABOUTME: Weighted criteria scoring with convergence on quality threshold

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use maestro_agents::{AgentRegistry, AgentType};
use maestro_core::{AgentContext, AgentExecutionInput, ExecutionId, MaestroError, Result};
use maestro_events::{BusEvent, EventBus};
use maestro_templates::TemplateStore;

use crate::extract::extract_first_json_object;

/// One weighted quality criterion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCriterion {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Extra guidance given to the evaluator for this criterion
    #[serde(rename = "evaluationPrompt", default)]
    pub evaluation_prompt: String,
    pub weight: f64,
    /// Minimum acceptable score for this criterion
    pub threshold: f64,
}

/// Self-critique options
#[derive(Debug, Clone)]
pub struct CritiqueOptions {
    pub max_iterations: u32,
    pub quality_criteria: Vec<QualityCriterion>,
    /// Overall score at which the loop may stop
    pub stop_on_quality_threshold: f64,
    /// Template for the evaluation call
    pub evaluation_template: String,
    /// Template for the improvement call
    pub improvement_template: String,
    /// Evaluator agent; the default llm agent when absent
    pub evaluator_agent_id: Option<String>,
    /// Wall-clock budget for the whole loop
    pub timeout: Duration,
    /// Timeout for each agent call
    pub call_timeout: Duration,
}

impl Default for CritiqueOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            quality_criteria: Vec::new(),
            stop_on_quality_threshold: 0.8,
            evaluation_template: "critique-evaluation".to_string(),
            improvement_template: "critique-improvement".to_string(),
            evaluator_agent_id: None,
            timeout: Duration::from_secs(600),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Parsed critique of one iteration's output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    #[serde(rename = "overallScore")]
    pub overall_score: f64,
    #[serde(rename = "criteriaScores")]
    pub criteria_scores: HashMap<String, f64>,
    pub feedback: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(rename = "meetsThreshold")]
    pub meets_threshold: bool,
}

/// Record of one iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueIteration {
    pub iteration: u32,
    pub output: String,
    pub critique: Critique,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Final result of a self-critique run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueResult {
    pub id: String,
    pub iterations: Vec<CritiqueIteration>,
    #[serde(rename = "finalOutput")]
    pub final_output: String,
    #[serde(rename = "finalScore")]
    pub final_score: f64,
    pub converged: bool,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

/// Iterative self-critique loop: execute the seed task, evaluate the
/// output against weighted criteria, synthesize an improvement prompt,
/// and repeat until quality converges or iterations run out.
pub struct SelfCritiqueService {
    registry: Arc<AgentRegistry>,
    templates: Arc<TemplateStore>,
    bus: Arc<EventBus>,
}

impl SelfCritiqueService {
    pub fn new(
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            templates,
            bus,
        }
    }

    /// Run the loop for a seed prompt
    pub async fn run(
        &self,
        seed_prompt: &str,
        agent_id: Option<String>,
        options: CritiqueOptions,
        user_id: &str,
    ) -> Result<CritiqueResult> {
        if options.quality_criteria.is_empty() {
            return Err(MaestroError::validation_field(
                "self-critique needs at least one quality criterion",
                "qualityCriteria",
            ));
        }
        if options.max_iterations == 0 {
            return Err(MaestroError::validation_field(
                "maxIterations must be at least 1",
                "maxIterations",
            ));
        }

        let id = ExecutionId::new().to_string();
        let execution = ExecutionId::parse(&id).unwrap_or_default();
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let deadline = started + options.timeout;

        let worker_agent = match &agent_id {
            Some(id) => id.clone(),
            None => self
                .registry
                .resolve_default(AgentType::Llm)
                .map(|record| record.id)
                .ok_or_else(|| MaestroError::AgentUnavailable {
                    id: "no default llm agent".into(),
                })?,
        };
        let evaluator_agent = options
            .evaluator_agent_id
            .clone()
            .unwrap_or_else(|| worker_agent.clone());

        let criteria_text = render_criteria(&options.quality_criteria);
        let mut iterations: Vec<CritiqueIteration> = Vec::new();
        let mut converged = false;

        for iteration in 1..=options.max_iterations {
            if std::time::Instant::now() >= deadline {
                warn!(execution_id = %id, iteration, "critique wall clock exceeded");
                break;
            }
            self.emit(
                &id,
                "critique.iteration-started",
                json!({ "iteration": iteration }),
            );
            let iteration_started = std::time::Instant::now();

            // Execute: the seed on iteration 1, an improvement prompt after.
            let prompt = if iteration == 1 {
                seed_prompt.to_string()
            } else {
                let previous = iterations.last().expect("prior iteration exists");
                let mut vars = Map::new();
                vars.insert("task".into(), json!(seed_prompt));
                vars.insert("output".into(), json!(previous.output));
                vars.insert("feedback".into(), json!(previous.critique.feedback));
                vars.insert(
                    "suggestions".into(),
                    json!(previous.critique.suggestions.join("\n")),
                );
                self.templates
                    .render(&options.improvement_template, &vars)
                    .await?
            };

            let output = self
                .invoke(&worker_agent, &prompt, user_id, execution, options.call_timeout)
                .await?;

            // Evaluate against the criteria.
            let mut vars = Map::new();
            vars.insert("task".into(), json!(seed_prompt));
            vars.insert("output".into(), json!(output));
            vars.insert("criteria".into(), json!(criteria_text));
            let evaluation_prompt = self
                .templates
                .render(&options.evaluation_template, &vars)
                .await?;
            let evaluation_reply = self
                .invoke(
                    &evaluator_agent,
                    &evaluation_prompt,
                    user_id,
                    execution,
                    options.call_timeout,
                )
                .await?;

            let critique = parse_critique(&evaluation_reply, &options.quality_criteria);
            self.emit(
                &id,
                "critique.iteration",
                json!({
                    "iteration": iteration,
                    "overallScore": critique.overall_score,
                    "criteriaScores": critique.criteria_scores,
                    "meetsThreshold": critique.meets_threshold,
                }),
            );
            debug!(
                execution_id = %id,
                iteration,
                score = critique.overall_score,
                "critique iteration evaluated"
            );

            let record = CritiqueIteration {
                iteration,
                output,
                critique: critique.clone(),
                duration_ms: iteration_started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            };
            iterations.push(record);

            if critique.meets_threshold
                && critique.overall_score >= options.stop_on_quality_threshold
            {
                converged = true;
                self.emit(
                    &id,
                    "critique.converged",
                    json!({ "iteration": iteration, "score": critique.overall_score }),
                );
                break;
            }
            if iteration == options.max_iterations {
                self.emit(
                    &id,
                    "critique.max-iterations",
                    json!({ "iterations": iteration }),
                );
            }
        }

        let last = iterations
            .last()
            .ok_or_else(|| MaestroError::Execution {
                message: "critique produced no iterations".into(),
            })?;
        let result = CritiqueResult {
            id: id.clone(),
            final_output: last.output.clone(),
            final_score: last.critique.overall_score,
            converged,
            iterations,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        };
        self.emit(
            &id,
            "critique.completed",
            json!({
                "converged": result.converged,
                "finalScore": result.final_score,
                "iterations": result.iterations.len(),
            }),
        );
        info!(execution_id = %id, converged = result.converged, "critique finished");
        Ok(result)
    }

    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        user_id: &str,
        execution: ExecutionId,
        timeout: Duration,
    ) -> Result<String> {
        let input = AgentExecutionInput::new(
            prompt,
            AgentContext::for_user(user_id).with_execution(execution),
        )
        .with_timeout(timeout);
        let output = self.registry.execute(agent_id, input).await?;
        if !output.success {
            return Err(MaestroError::Execution {
                message: output
                    .error
                    .unwrap_or_else(|| "agent call failed".to_string()),
            });
        }
        Ok(output.result_text())
    }

    fn emit(&self, id: &str, event_type: &str, data: Value) {
        self.bus.publish(BusEvent::new(event_type, id, data));
    }
}

fn render_criteria(criteria: &[QualityCriterion]) -> String {
    criteria
        .iter()
        .map(|criterion| {
            let mut line = format!(
                "- {} (weight {}, threshold {}): {}",
                criterion.name, criterion.weight, criterion.threshold, criterion.description
            );
            if !criterion.evaluation_prompt.is_empty() {
                line.push_str("\n  ");
                line.push_str(&criterion.evaluation_prompt);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the evaluator's reply. A reply with no parseable JSON object
/// scores every criterion 0.5 and does not meet the threshold.
fn parse_critique(reply: &str, criteria: &[QualityCriterion]) -> Critique {
    let parsed = extract_first_json_object(reply);
    let (scores_value, feedback, suggestions) = match &parsed {
        Some(value) => (
            value.get("criteriaScores").cloned(),
            value
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            value
                .get("suggestions")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        None => (None, String::new(), Vec::new()),
    };

    let parse_failed = parsed.is_none() || scores_value.is_none();
    let mut criteria_scores = HashMap::new();
    for criterion in criteria {
        let score = scores_value
            .as_ref()
            .and_then(|scores| scores.get(&criterion.name))
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        criteria_scores.insert(criterion.name.clone(), score);
    }

    let total_weight: f64 = criteria.iter().map(|c| c.weight).sum();
    let overall_score = if total_weight > 0.0 {
        criteria
            .iter()
            .map(|c| criteria_scores[&c.name] * c.weight)
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };
    let meets_threshold = !parse_failed
        && criteria
            .iter()
            .all(|c| criteria_scores[&c.name] >= c.threshold);

    Critique {
        overall_score,
        criteria_scores,
        feedback: if parse_failed {
            "evaluation response could not be parsed".to_string()
        } else {
            feedback
        },
        suggestions,
        meets_threshold,
    }
}
