//! ABOUTME: OrchestrationService — runs the four composition patterns
//! ABOUTME: Context threading, bounded-parallel fan-out, condition routing, map-reduce

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

use maestro_agents::AgentRegistry;
use maestro_core::{expr, AgentContext, AgentExecutionInput, ExecutionId, MaestroError, Result};
use maestro_events::{BusEvent, EventBus};
use maestro_templates::{interpolate, TemplateStore};

use crate::types::{
    OrchestrationPattern, OrchestrationRequest, OrchestrationResult, OrchestrationStatus, Task,
    TaskResult,
};

/// Orchestration configuration
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Parallel tasks when the request sets no cap
    pub default_max_parallel: usize,
    /// Items accepted by map-reduce
    pub max_items: usize,
    /// Per-task timeout when neither task nor request set one
    pub default_task_timeout: Duration,
    /// Overall deadline when the request sets none
    pub default_timeout: Duration,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: 5,
            max_items: 100,
            default_task_timeout: Duration::from_secs(120),
            default_timeout: Duration::from_secs(600),
        }
    }
}

/// Orchestration service for sequential / parallel / conditional /
/// map-reduce compositions over tasks.
pub struct OrchestrationService {
    registry: Arc<AgentRegistry>,
    templates: Arc<TemplateStore>,
    bus: Arc<EventBus>,
    config: OrchestrationConfig,
}

impl OrchestrationService {
    pub fn new(
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_config(registry, templates, bus, OrchestrationConfig::default())
    }

    pub fn with_config(
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        bus: Arc<EventBus>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            registry,
            templates,
            bus,
            config,
        }
    }

    /// Run an orchestration request to completion
    pub async fn orchestrate(&self, request: OrchestrationRequest) -> Result<OrchestrationResult> {
        if request.tasks.is_empty() {
            return Err(MaestroError::validation_field(
                "orchestration needs at least one task",
                "tasks",
            ));
        }

        let id = ExecutionId::new().to_string();
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let mut context = match request.context.clone() {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(MaestroError::validation_field(
                    "context must be a JSON object",
                    "context",
                ))
            }
            None => Map::new(),
        };

        self.bus.publish(BusEvent::new(
            "orchestration.started",
            &id,
            json!({ "pattern": request.pattern }),
        ));
        info!(execution_id = %id, pattern = ?request.pattern, "orchestration started");

        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);
        let run = self.run_pattern(&id, &request, &mut context);
        let outcome = match tokio::time::timeout(deadline, run).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MaestroError::Timeout {
                message: format!("orchestration timed out after {}ms", deadline.as_millis()),
            }),
        };

        let completed_at = Utc::now();
        let result = match outcome {
            Ok((task_results, aggregated)) => {
                let failed = task_results.iter().any(|r| !r.success);
                OrchestrationResult {
                    id: id.clone(),
                    status: if failed {
                        OrchestrationStatus::Failed
                    } else {
                        OrchestrationStatus::Completed
                    },
                    pattern: request.pattern,
                    error: task_results
                        .iter()
                        .find(|r| !r.success)
                        .and_then(|r| r.error.clone()),
                    task_results,
                    duration_ms: started.elapsed().as_millis() as u64,
                    started_at,
                    completed_at,
                    aggregated_result: aggregated,
                }
            }
            Err(err) => OrchestrationResult {
                id: id.clone(),
                status: OrchestrationStatus::Failed,
                pattern: request.pattern,
                task_results: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                started_at,
                completed_at,
                aggregated_result: None,
                error: Some(err.to_string()),
            },
        };

        let event_type = match result.status {
            OrchestrationStatus::Completed => "orchestration.completed",
            OrchestrationStatus::Failed => "orchestration.failed",
        };
        self.bus.publish(BusEvent::new(
            event_type,
            &id,
            json!({ "status": result.status, "error": result.error }),
        ));
        Ok(result)
    }

    async fn run_pattern(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        context: &mut Map<String, Value>,
    ) -> Result<(Vec<TaskResult>, Option<Value>)> {
        match request.pattern {
            OrchestrationPattern::Sequential => self.sequential(id, request, context).await,
            OrchestrationPattern::Parallel => self.parallel(id, request, context).await,
            OrchestrationPattern::Conditional => self.conditional(id, request, context).await,
            OrchestrationPattern::MapReduce => self.map_reduce(id, request, context).await,
        }
    }

    /// Execute in order, short-circuit on first failure, thread results
    /// under `_lastResult` and `_task_<id>`.
    async fn sequential(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        context: &mut Map<String, Value>,
    ) -> Result<(Vec<TaskResult>, Option<Value>)> {
        let mut results = Vec::with_capacity(request.tasks.len());
        for task in &request.tasks {
            let result = self.run_task(id, request, task, context).await;
            let success = result.success;
            if success {
                let value = result.result.clone().unwrap_or(Value::Null);
                context.insert("_lastResult".to_string(), value.clone());
                context.insert(format!("_task_{}", task.id), value);
            }
            results.push(result);
            if !success {
                break;
            }
        }
        let aggregated = context.get("_lastResult").cloned();
        Ok((results, aggregated))
    }

    /// Execute in bounded-parallel batches; success iff all succeed
    async fn parallel(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        context: &mut Map<String, Value>,
    ) -> Result<(Vec<TaskResult>, Option<Value>)> {
        let cap = request
            .max_parallel
            .unwrap_or(self.config.default_max_parallel)
            .max(1);
        let mut results: Vec<Option<TaskResult>> = vec![None; request.tasks.len()];

        for (batch_index, batch) in request.tasks.chunks(cap).enumerate() {
            let batch_start = batch_index * cap;
            let mut join_set = JoinSet::new();
            for (offset, task) in batch.iter().enumerate() {
                let index = batch_start + offset;
                let task = task.clone();
                let request = request.clone();
                let context = context.clone();
                let this = self.cheap_clone();
                let id = id.to_string();
                join_set.spawn(async move {
                    let result = this.run_task(&id, &request, &task, &context).await;
                    (index, result)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                if let Ok((index, result)) = joined {
                    results[index] = Some(result);
                }
            }
        }

        let results: Vec<TaskResult> = results.into_iter().flatten().collect();
        Ok((results, None))
    }

    /// Pick the first task whose condition holds (or the first
    /// unconditional task) and execute only that one.
    async fn conditional(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        context: &mut Map<String, Value>,
    ) -> Result<(Vec<TaskResult>, Option<Value>)> {
        let data = Value::Object(context.clone());
        let mut selected: Option<&Task> = None;
        for task in &request.tasks {
            match &task.condition {
                Some(condition) => {
                    if expr::evaluate_condition(condition, &data)? {
                        selected = Some(task);
                        break;
                    }
                }
                None => {
                    selected = Some(task);
                    break;
                }
            }
        }
        let task = selected.ok_or_else(|| MaestroError::Execution {
            message: "no task condition matched and no fallback task present".into(),
        })?;
        debug!(execution_id = %id, task_id = %task.id, "conditional pattern selected task");

        let result = self.run_task(id, request, task, context).await;
        let aggregated = result.result.clone();
        Ok((vec![result], aggregated))
    }

    /// Bounded-parallel map over items, then an optional reduce with
    /// `_mapResults` and `_resultCount` in context.
    async fn map_reduce(
        &self,
        id: &str,
        request: &OrchestrationRequest,
        context: &mut Map<String, Value>,
    ) -> Result<(Vec<TaskResult>, Option<Value>)> {
        let items = request.items.clone().unwrap_or_default();
        if items.is_empty() {
            return Err(MaestroError::validation_field(
                "map-reduce needs at least one item",
                "items",
            ));
        }
        if items.len() > self.config.max_items {
            return Err(MaestroError::validation_field(
                format!("map-reduce accepts at most {} items", self.config.max_items),
                "items",
            ));
        }
        let map_task = &request.tasks[0];
        let reduce_task = request.tasks.get(1);
        let cap = request
            .max_parallel
            .unwrap_or(self.config.default_max_parallel)
            .max(1);

        let mut results: Vec<Option<TaskResult>> = vec![None; items.len()];
        for (batch_index, batch) in items.chunks(cap).enumerate() {
            let batch_start = batch_index * cap;
            let mut join_set = JoinSet::new();
            for (offset, item) in batch.iter().enumerate() {
                let index = batch_start + offset;
                let mut item_context = context.clone();
                item_context.insert("_item".to_string(), item.clone());
                item_context.insert("_itemIndex".to_string(), json!(index));
                let task = map_task.clone();
                let request = request.clone();
                let this = self.cheap_clone();
                let id = id.to_string();
                join_set.spawn(async move {
                    let result = this.run_task(&id, &request, &task, &item_context).await;
                    (index, result)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                if let Ok((index, result)) = joined {
                    results[index] = Some(result);
                }
            }
        }

        let mut task_results: Vec<TaskResult> = results.into_iter().flatten().collect();
        if task_results.iter().any(|r| !r.success) {
            return Ok((task_results, None));
        }

        let map_values: Vec<Value> = task_results
            .iter()
            .map(|r| r.result.clone().unwrap_or(Value::Null))
            .collect();
        context.insert("_mapResults".to_string(), Value::Array(map_values.clone()));
        context.insert("_resultCount".to_string(), json!(map_values.len()));

        let aggregated = match reduce_task {
            Some(reduce) => {
                let result = self.run_task(id, request, reduce, context).await;
                let aggregated = result.result.clone();
                let failed = !result.success;
                task_results.push(result);
                if failed {
                    return Ok((task_results, None));
                }
                aggregated
            }
            None => Some(Value::Array(map_values)),
        };
        Ok((task_results, aggregated))
    }

    /// Run one task against its agent, rendering the prompt from context
    async fn run_task(
        &self,
        execution_id: &str,
        request: &OrchestrationRequest,
        task: &Task,
        context: &Map<String, Value>,
    ) -> TaskResult {
        let started = std::time::Instant::now();
        let fail = |error: String, started: std::time::Instant| TaskResult {
            task_id: task.id.clone(),
            success: false,
            result: None,
            error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let agent_id = match &task.agent_id {
            Some(id) => id.clone(),
            None => match self.registry.resolve_default(task.agent_type) {
                Some(record) => record.id,
                None => {
                    return fail(
                        format!("no agent registered for type '{}'", task.agent_type),
                        started,
                    )
                }
            },
        };

        let prompt = if let Some(template_id) = &task.prompt_template_id {
            match self.templates.render(template_id, context).await {
                Ok(prompt) => prompt,
                Err(err) => return fail(err.to_string(), started),
            }
        } else {
            let inline = task.prompt.clone().unwrap_or_default();
            match interpolate::interpolate(&inline, context, &[]) {
                Ok(prompt) => prompt,
                Err(err) => return fail(err.to_string(), started),
            }
        };

        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_task_timeout);
        let input = AgentExecutionInput::new(
            prompt,
            AgentContext::for_user(request.user_id.clone()).with_execution(
                ExecutionId::parse(execution_id)
                    .unwrap_or_else(|| ExecutionId::from_name(execution_id)),
            ),
        )
        .with_timeout(timeout);

        match self.registry.execute(&agent_id, input).await {
            Ok(output) => TaskResult {
                task_id: task.id.clone(),
                success: output.success,
                result: output.result,
                error: output.error,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => fail(err.to_string(), started),
        }
    }

    fn cheap_clone(&self) -> OrchestrationService {
        OrchestrationService {
            registry: self.registry.clone(),
            templates: self.templates.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }
}
