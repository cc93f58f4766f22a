//! ABOUTME: WorkflowEngine — admission, DAG scheduling, step execution, control
//! ABOUTME: Bounded-parallel ready-step loop with skip propagation and pause/cancel

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_agents::AgentRegistry;
use maestro_context::ContextStore;
use maestro_core::{
    expr, paths, AgentContext, AgentExecutionInput, ExecutionId, MaestroError, Result,
};
use maestro_events::{BusEvent, EventBus};
use maestro_store::{keys, StoreBackend};
use maestro_templates::{interpolate, TemplateStore};

use crate::state::{StepStatus, WorkflowState, WorkflowStatus};
use crate::types::{InputSource, RetryPolicy, WorkflowDefinition, WorkflowStep};
use crate::validation::{topological_order, validate_definition};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    /// Workflows admitted at once
    pub max_concurrent_workflows: usize,
    /// Whether excess submissions queue instead of failing fast
    pub queue_enabled: bool,
    /// Admission queue length before failing fast
    pub max_queue_size: u64,
    /// Steps accepted per definition
    pub max_steps: usize,
    /// Per-workflow parallel step cap (also the default when the
    /// definition sets none)
    pub max_parallel_steps: usize,
    /// Steps running at once across all workflows
    pub global_max_parallel_steps: usize,
    /// Step timeout when neither step nor definition set one
    pub default_step_timeout: Duration,
    /// Workflow deadline when the definition sets none
    pub default_workflow_timeout: Duration,
    /// Scheduler poll interval for pause/ready re-checks
    pub poll_interval: Duration,
    /// TTL on persisted workflow state
    pub state_ttl: Duration,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            queue_enabled: true,
            max_queue_size: 50,
            max_steps: 100,
            max_parallel_steps: 5,
            global_max_parallel_steps: 20,
            default_step_timeout: Duration::from_secs(120),
            default_workflow_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(25),
            state_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct ExecutionControl {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

struct PendingExecution {
    definition: WorkflowDefinition,
    user_id: String,
    initial_context: Option<Value>,
}

struct EngineInner {
    store: Arc<dyn StoreBackend>,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    templates: Arc<TemplateStore>,
    contexts: Arc<ContextStore>,
    config: WorkflowEngineConfig,
    controls: DashMap<String, ExecutionControl>,
    pending: DashMap<String, PendingExecution>,
    global_steps: Arc<Semaphore>,
    admit_notify: Notify,
    shutdown: CancellationToken,
}

/// Outcome of one spawned step task
enum StepOutcome {
    Completed(Value),
    Failed(String),
}

struct StepTaskResult {
    step_id: String,
    outcome: StepOutcome,
    retry_count: u32,
    duration_ms: u64,
}

enum RunEnd {
    Drained,
    Cancelled,
    TimedOut,
}

/// Workflow engine.
///
/// Validates DAGs, admits executions under a concurrency cap (queueing
/// the rest FIFO), and drives each admitted workflow through a
/// ready-step loop with bounded parallelism, per-step retry, skip
/// propagation, and cooperative pause/cancel.
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        contexts: Arc<ContextStore>,
    ) -> Self {
        Self::with_config(
            store,
            bus,
            registry,
            templates,
            contexts,
            WorkflowEngineConfig::default(),
        )
    }

    pub fn with_config(
        store: Arc<dyn StoreBackend>,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        templates: Arc<TemplateStore>,
        contexts: Arc<ContextStore>,
        config: WorkflowEngineConfig,
    ) -> Self {
        let global_steps = Arc::new(Semaphore::new(config.global_max_parallel_steps));
        let inner = Arc::new(EngineInner {
            store,
            bus,
            registry,
            templates,
            contexts,
            config,
            controls: DashMap::new(),
            pending: DashMap::new(),
            global_steps,
            admit_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let admitter = inner.clone();
        tokio::spawn(async move {
            admitter.admission_loop().await;
        });
        Self { inner }
    }

    /// Submit a workflow. Returns the initial state: Running when
    /// admitted immediately, Queued with a position otherwise.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        user_id: impl Into<String>,
        initial_context: Option<Value>,
    ) -> Result<WorkflowState> {
        let inner = &self.inner;
        let user_id = user_id.into();
        validate_definition(&definition, inner.config.max_steps)?;

        let execution_id = ExecutionId::new().to_string();
        let mut state = WorkflowState::new(
            execution_id.clone(),
            definition.id.clone(),
            user_id.clone(),
            definition.steps.iter().map(|s| s.id.clone()),
        );

        inner
            .store
            .set_add(&keys::workflow_user(&user_id), execution_id.clone())
            .await?;

        let active = inner.store.set_card(keys::WORKFLOW_ACTIVE).await?;
        if active < inner.config.max_concurrent_workflows as u64 {
            state.status = WorkflowStatus::Running;
            state.started_at = Some(Utc::now());
            inner.persist(&state).await?;
            inner
                .start_execution(
                    execution_id.clone(),
                    PendingExecution {
                        definition,
                        user_id,
                        initial_context,
                    },
                )
                .await?;
            return Ok(state);
        }

        if !inner.config.queue_enabled {
            return Err(MaestroError::Capacity {
                message: "workflow concurrency cap reached and queueing is disabled".into(),
            });
        }
        let queued = inner.store.list_len(keys::WORKFLOW_QUEUE).await?;
        if queued >= inner.config.max_queue_size {
            return Err(MaestroError::Capacity {
                message: format!(
                    "workflow admission queue full ({} entries)",
                    inner.config.max_queue_size
                ),
            });
        }

        // State and pending entry go in before the queue entry so the
        // admission loop never pops an ID it cannot resolve.
        state.status = WorkflowStatus::Queued;
        inner.persist(&state).await?;
        inner.pending.insert(
            execution_id.clone(),
            PendingExecution {
                definition,
                user_id,
                initial_context,
            },
        );
        let position = inner
            .store
            .list_push_back(keys::WORKFLOW_QUEUE, execution_id.clone())
            .await?;
        state.queue_position = Some(position);
        inner.persist(&state).await?;
        inner.admit_notify.notify_one();
        Ok(state)
    }

    /// Current execution state, with a live queue position when queued
    pub async fn status(&self, execution_id: &str) -> Result<Option<WorkflowState>> {
        let mut state = match self.inner.load(execution_id).await? {
            Some(state) => state,
            None => return Ok(None),
        };
        if state.status == WorkflowStatus::Queued {
            let entries = self
                .inner
                .store
                .list_range(keys::WORKFLOW_QUEUE, 0, -1)
                .await?;
            state.queue_position = entries
                .iter()
                .position(|id| id == execution_id)
                .map(|pos| pos as u64 + 1);
        }
        Ok(Some(state))
    }

    /// Cancel an execution; false when already terminal
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let state = self
            .inner
            .load(execution_id)
            .await?
            .ok_or_else(|| MaestroError::not_found("execution", execution_id))?;
        if state.status.is_terminal() {
            return Ok(false);
        }

        if state.status == WorkflowStatus::Queued {
            // The queue entry is skipped lazily at admission time.
            self.inner.pending.remove(execution_id);
            let mut cancelled = state;
            cancelled.status = WorkflowStatus::Cancelled;
            cancelled.completed_at = Some(Utc::now());
            cancelled.queue_position = None;
            for step in cancelled.steps.values_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                    step.error = Some("workflow cancelled".into());
                }
            }
            cancelled.refresh_progress();
            self.inner.persist(&cancelled).await?;
            self.inner
                .emit(execution_id, "workflow.cancelled", json!({}));
            return Ok(true);
        }

        if let Some(control) = self.inner.controls.get(execution_id) {
            control.cancel.cancel();
            return Ok(true);
        }

        // Running state without a live runner (e.g. a previous engine
        // instance): write the terminal state directly.
        let mut cancelled = state;
        cancelled.status = WorkflowStatus::Cancelled;
        cancelled.completed_at = Some(Utc::now());
        self.inner.persist(&cancelled).await?;
        self.inner
            .emit(execution_id, "workflow.cancelled", json!({}));
        Ok(true)
    }

    /// Pause a running execution; observed between scheduling rounds
    pub async fn pause(&self, execution_id: &str) -> Result<bool> {
        let state = self
            .inner
            .load(execution_id)
            .await?
            .ok_or_else(|| MaestroError::not_found("execution", execution_id))?;
        if state.status != WorkflowStatus::Running {
            return Ok(false);
        }
        match self.inner.controls.get(execution_id) {
            Some(control) => {
                control.paused.store(true, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resume a paused execution
    pub async fn resume(&self, execution_id: &str) -> Result<bool> {
        match self.inner.controls.get(execution_id) {
            Some(control) => Ok(control.paused.swap(false, Ordering::SeqCst)),
            None => Ok(false),
        }
    }

    /// Execution IDs submitted by a user
    pub async fn user_executions(&self, user_id: &str) -> Result<Vec<String>> {
        self.inner
            .store
            .set_members(&keys::workflow_user(user_id))
            .await
    }

    /// Stop the admission loop and cancel every running workflow
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for control in self.inner.controls.iter() {
            control.value().cancel.cancel();
        }
    }
}

impl Drop for WorkflowEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    async fn admission_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.admit_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            if let Err(err) = self.admit_queued().await {
                warn!(error = %err, "workflow admission failed");
            }
        }
    }

    async fn admit_queued(self: &Arc<Self>) -> Result<()> {
        loop {
            let active = self.store.set_card(keys::WORKFLOW_ACTIVE).await?;
            if active >= self.config.max_concurrent_workflows as u64 {
                return Ok(());
            }
            let execution_id = match self.store.list_pop_front(keys::WORKFLOW_QUEUE).await? {
                Some(id) => id,
                None => return Ok(()),
            };
            let pending = match self.pending.remove(&execution_id) {
                Some((_, pending)) => pending,
                None => continue, // cancelled while queued
            };
            let mut state = match self.load(&execution_id).await? {
                Some(state) if state.status == WorkflowStatus::Queued => state,
                _ => continue,
            };
            state.status = WorkflowStatus::Running;
            state.started_at = Some(Utc::now());
            state.queue_position = None;
            self.persist(&state).await?;
            self.start_execution(execution_id, pending).await?;
        }
    }

    async fn start_execution(
        self: &Arc<Self>,
        execution_id: String,
        pending: PendingExecution,
    ) -> Result<()> {
        self.store
            .set_add(keys::WORKFLOW_ACTIVE, execution_id.clone())
            .await?;
        let control = ExecutionControl {
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
        };
        let cancel = control.cancel.clone();
        let paused = control.paused.clone();
        self.controls.insert(execution_id.clone(), control);

        let runner = self.clone();
        tokio::spawn(async move {
            runner
                .run_workflow(execution_id, pending, cancel, paused)
                .await;
        });
        Ok(())
    }

    async fn run_workflow(
        self: Arc<Self>,
        execution_id: String,
        pending: PendingExecution,
        cancel: CancellationToken,
        paused: Arc<AtomicBool>,
    ) {
        let PendingExecution {
            definition,
            user_id,
            initial_context,
        } = pending;

        if let Err(err) = self
            .drive(&execution_id, &definition, &user_id, initial_context, &cancel, &paused)
            .await
        {
            error!(execution_id = %execution_id, error = %err, "workflow runner failed");
            if let Ok(Some(mut state)) = self.load(&execution_id).await {
                if !state.status.is_terminal() {
                    state.status = WorkflowStatus::Failed;
                    state.error = Some(err.to_string());
                    state.completed_at = Some(Utc::now());
                    let _ = self.persist(&state).await;
                    self.emit(
                        &execution_id,
                        "workflow.failed",
                        json!({ "error": err.to_string() }),
                    );
                }
            }
        }

        self.controls.remove(&execution_id);
        let _ = self
            .store
            .set_remove(keys::WORKFLOW_ACTIVE, &execution_id)
            .await;
        self.admit_notify.notify_one();
    }

    #[allow(clippy::too_many_lines)]
    async fn drive(
        self: &Arc<Self>,
        execution_id: &str,
        definition: &WorkflowDefinition,
        user_id: &str,
        initial_context: Option<Value>,
        cancel: &CancellationToken,
        paused: &Arc<AtomicBool>,
    ) -> Result<()> {
        let mut seed = match definition.initial_context.clone() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(extra)) = initial_context {
            for (key, value) in extra {
                seed.insert(key, value);
            }
        }
        self.contexts
            .create(execution_id, Value::Object(seed), None)
            .await?;

        self.emit(
            execution_id,
            "workflow.started",
            json!({ "workflowId": definition.id, "name": definition.name }),
        );
        info!(execution_id, workflow_id = %definition.id, "workflow started");

        let workflow_timeout = definition
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_workflow_timeout);
        let deadline = tokio::time::Instant::now() + workflow_timeout;
        let parallel_cap = definition
            .max_parallel_steps
            .unwrap_or(self.config.max_parallel_steps)
            .min(self.config.max_parallel_steps)
            .max(1);

        let order = topological_order(definition);
        let mut state = self
            .load(execution_id)
            .await?
            .ok_or_else(|| MaestroError::not_found("execution", execution_id))?;
        // A stale queued-state write may have raced admission; the
        // runner is authoritative once started.
        state.status = WorkflowStatus::Running;
        state.queue_position = None;
        let mut join_set: JoinSet<StepTaskResult> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut pause_announced = false;

        let end = 'run: loop {
            if cancel.is_cancelled() {
                break 'run RunEnd::Cancelled;
            }
            if tokio::time::Instant::now() >= deadline {
                break 'run RunEnd::TimedOut;
            }

            // Pause is observed between scheduling rounds; in-flight
            // steps drain, nothing new dispatches.
            let is_paused = paused.load(Ordering::SeqCst);
            if is_paused && !pause_announced {
                pause_announced = true;
                let _ = self.contexts.snapshot(execution_id, "pause").await;
                state.status = WorkflowStatus::Paused;
                self.persist(&state).await?;
                self.emit(execution_id, "workflow.paused", json!({}));
            } else if !is_paused && pause_announced {
                pause_announced = false;
                state.status = WorkflowStatus::Running;
                self.persist(&state).await?;
                self.emit(execution_id, "workflow.resumed", json!({}));
            }

            self.propagate_skips(definition, &mut state).await?;

            if !is_paused {
                self.dispatch_ready(
                    execution_id,
                    definition,
                    user_id,
                    &order,
                    &mut state,
                    &mut running,
                    &mut join_set,
                    parallel_cap,
                    cancel,
                )
                .await?;
            }

            if running.is_empty() {
                if state.all_steps_terminal() {
                    break 'run RunEnd::Drained;
                }
                // Paused, or ready steps blocked on the global cap.
                tokio::select! {
                    _ = cancel.cancelled() => break 'run RunEnd::Cancelled,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(task)) => {
                            running.remove(&task.step_id);
                            self.apply_step_result(execution_id, &mut state, task).await?;
                        }
                        Some(Err(join_err)) => {
                            warn!(execution_id, error = %join_err, "step task panicked");
                        }
                        None => {
                            // The join set drained with steps still marked
                            // running: their tasks are gone. Fail them so
                            // the workflow can settle instead of spinning.
                            for step_id in running.drain() {
                                if let Some(entry) = state.steps.get_mut(&step_id) {
                                    if entry.status == StepStatus::Running {
                                        entry.status = StepStatus::Failed;
                                        entry.error = Some("step task aborted".into());
                                        entry.completed_at = Some(Utc::now());
                                    }
                                }
                            }
                            state.refresh_progress();
                            self.persist(&state).await?;
                        }
                    }
                }
                _ = cancel.cancelled() => break 'run RunEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break 'run RunEnd::TimedOut,
            }
        };

        // Abort anything still in flight, then settle final statuses.
        join_set.shutdown().await;
        let interrupt_reason = match end {
            RunEnd::Drained => None,
            RunEnd::Cancelled => Some("workflow cancelled"),
            RunEnd::TimedOut => Some("workflow timed out"),
        };
        if let Some(reason) = interrupt_reason {
            let now = Utc::now();
            for step in state.steps.values_mut() {
                match step.status {
                    StepStatus::Running => {
                        step.status = StepStatus::Failed;
                        step.error = Some(reason.to_string());
                        step.completed_at = Some(now);
                    }
                    StepStatus::Pending | StepStatus::Waiting => {
                        step.status = StepStatus::Skipped;
                        step.error = Some(reason.to_string());
                    }
                    _ => {}
                }
            }
        }

        let (status, event_type) = match end {
            RunEnd::Drained => {
                if state.any_step_failed() {
                    (WorkflowStatus::Failed, "workflow.failed")
                } else {
                    (WorkflowStatus::Completed, "workflow.completed")
                }
            }
            RunEnd::Cancelled => (WorkflowStatus::Cancelled, "workflow.cancelled"),
            RunEnd::TimedOut => (WorkflowStatus::Failed, "workflow.failed"),
        };
        state.status = status;
        state.completed_at = Some(Utc::now());
        if matches!(end, RunEnd::TimedOut) {
            state.error = Some("workflow timed out".into());
        } else if status == WorkflowStatus::Failed && state.error.is_none() {
            state.error = state
                .steps
                .values()
                .find(|s| s.status == StepStatus::Failed)
                .and_then(|s| s.error.clone());
        }
        state.refresh_progress();
        self.persist(&state).await?;

        let duration_ms = state
            .started_at
            .zip(state.completed_at)
            .map(|(start, done)| (done - start).num_milliseconds().max(0))
            .unwrap_or(0);
        let sample = json!({
            "executionId": execution_id,
            "status": status,
            "durationMs": duration_ms,
        })
        .to_string();
        let metrics_key = keys::metrics("workflow", "durations");
        let _ = self.store.list_push_front(&metrics_key, sample).await;
        let _ = self.store.list_trim(&metrics_key, 0, 99).await;

        self.emit(
            execution_id,
            event_type,
            json!({ "status": status, "progress": state.progress, "error": state.error }),
        );
        info!(execution_id, ?status, "workflow finished");

        // The context is a soft cache; drop it once the execution ends.
        let _ = self.contexts.clear(execution_id).await;
        Ok(())
    }

    /// Mark steps skipped when a dependency failed without
    /// continueOnError, cascading through the graph.
    async fn propagate_skips(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
    ) -> Result<()> {
        let mut changed = true;
        let mut any = false;
        while changed {
            changed = false;
            for step in &definition.steps {
                let current = state.steps.get(&step.id).map(|s| s.status);
                if !matches!(current, Some(StepStatus::Pending | StepStatus::Waiting)) {
                    continue;
                }
                let blocked = step.dependencies.iter().any(|dep_id| {
                    let dep_state = match state.steps.get(dep_id) {
                        Some(dep) => dep,
                        None => return false,
                    };
                    let dep_continues = definition
                        .step(dep_id)
                        .map(|d| d.continue_on_error)
                        .unwrap_or(false);
                    match dep_state.status {
                        StepStatus::Failed => !dep_continues,
                        // Cascade-skips carry an error; condition skips
                        // do not block dependents.
                        StepStatus::Skipped => dep_state.error.is_some(),
                        _ => false,
                    }
                });
                if blocked {
                    let entry = state.steps.get_mut(&step.id).expect("known step");
                    entry.status = StepStatus::Skipped;
                    entry.error = Some("dependency failed".into());
                    changed = true;
                    any = true;
                }
            }
        }
        if any {
            state.refresh_progress();
            self.persist(state).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_ready(
        self: &Arc<Self>,
        execution_id: &str,
        definition: &WorkflowDefinition,
        user_id: &str,
        order: &[String],
        state: &mut WorkflowState,
        running: &mut HashSet<String>,
        join_set: &mut JoinSet<StepTaskResult>,
        parallel_cap: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut dirty = false;
        for step_id in order {
            if running.len() >= parallel_cap {
                break;
            }
            let status = state.steps.get(step_id).map(|s| s.status);
            if !matches!(status, Some(StepStatus::Pending | StepStatus::Waiting)) {
                continue;
            }
            let step = definition.step(step_id).expect("validated step");
            let deps_done = step.dependencies.iter().all(|dep| {
                state
                    .steps
                    .get(dep)
                    .map(|d| d.status.is_terminal())
                    .unwrap_or(false)
            });
            if !deps_done {
                continue;
            }

            // Condition gate: evaluated against the live context, false
            // skips without consuming capacity.
            if let Some(condition) = &step.condition {
                let data = self
                    .contexts
                    .get(execution_id)
                    .await?
                    .map(|c| c.data)
                    .unwrap_or(Value::Null);
                if !expr::evaluate_condition(condition, &data)? {
                    let entry = state.steps.get_mut(step_id).expect("known step");
                    entry.status = StepStatus::Skipped;
                    entry.result = Some(json!({ "skipped": true, "reason": "condition" }));
                    entry.completed_at = Some(Utc::now());
                    dirty = true;
                    debug!(execution_id, step_id = %step.id, "condition false, step skipped");
                    continue;
                }
            }

            let permit = match self.global_steps.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Global cap saturated; mark ready steps waiting.
                    let entry = state.steps.get_mut(step_id).expect("known step");
                    if entry.status == StepStatus::Pending {
                        entry.status = StepStatus::Waiting;
                        dirty = true;
                    }
                    break;
                }
            };

            let inputs = self.gather_inputs(execution_id, step, state).await?;
            let entry = state.steps.get_mut(step_id).expect("known step");
            entry.status = StepStatus::Running;
            entry.started_at = Some(Utc::now());
            dirty = true;
            running.insert(step_id.clone());
            self.emit(
                execution_id,
                "workflow.step.started",
                json!({ "stepId": step.id, "name": step.name }),
            );

            let retry_policy = step
                .retry_policy
                .clone()
                .or_else(|| definition.default_retry_policy.clone())
                .unwrap_or_default();
            let timeout = step
                .timeout_ms
                .or(definition.timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(self.config.default_step_timeout);

            let task_inner = self.clone();
            let task_execution = execution_id.to_string();
            let task_user = user_id.to_string();
            let task_step = step.clone();
            let task_cancel = cancel.clone();
            join_set.spawn(async move {
                execute_step(
                    task_inner,
                    task_execution,
                    task_user,
                    task_step,
                    inputs,
                    retry_policy,
                    timeout,
                    task_cancel,
                    permit,
                )
                .await
            });
        }

        if dirty {
            state.refresh_progress();
            self.persist(state).await?;
        }
        Ok(())
    }

    async fn gather_inputs(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
        state: &WorkflowState,
    ) -> Result<Map<String, Value>> {
        let mut values = Map::new();
        for input in &step.inputs {
            let value = match &input.source {
                InputSource::Context { path } => self
                    .contexts
                    .get_value(execution_id, path)
                    .await?
                    .unwrap_or(Value::Null),
                InputSource::Step { step_id, field } => {
                    let result = state
                        .steps
                        .get(step_id)
                        .and_then(|s| s.result.clone())
                        .unwrap_or(Value::Null);
                    match field {
                        Some(field) => paths::get_path(&result, field)
                            .cloned()
                            .unwrap_or(Value::Null),
                        None => result,
                    }
                }
                InputSource::Literal { value } => value.clone(),
            };
            values.insert(input.name.clone(), value);
        }
        Ok(values)
    }

    async fn apply_step_result(
        &self,
        execution_id: &str,
        state: &mut WorkflowState,
        task: StepTaskResult,
    ) -> Result<()> {
        let entry = state
            .steps
            .get_mut(&task.step_id)
            .ok_or_else(|| MaestroError::internal("completed step missing from state"))?;
        entry.retry_count = task.retry_count;
        entry.completed_at = Some(Utc::now());
        entry.duration_ms = Some(task.duration_ms);

        match task.outcome {
            StepOutcome::Completed(result) => {
                entry.status = StepStatus::Completed;
                entry.result = Some(result.clone());
                self.emit(
                    execution_id,
                    "workflow.step.completed",
                    json!({ "stepId": task.step_id, "durationMs": task.duration_ms }),
                );
            }
            StepOutcome::Failed(message) => {
                entry.status = StepStatus::Failed;
                entry.error = Some(message.clone());
                self.emit(
                    execution_id,
                    "workflow.step.failed",
                    json!({ "stepId": task.step_id, "error": message }),
                );
            }
        }

        state.refresh_progress();
        self.persist(state).await
    }

    async fn load(&self, execution_id: &str) -> Result<Option<WorkflowState>> {
        match self.store.get(&keys::workflow_state(execution_id)).await? {
            Some(raw) => {
                let state = serde_json::from_str(&raw)
                    .map_err(|e| MaestroError::storage(format!("corrupt workflow state: {}", e)))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, state: &WorkflowState) -> Result<()> {
        let raw = serde_json::to_string(state)
            .map_err(|e| MaestroError::internal(format!("serialize workflow state: {}", e)))?;
        self.store
            .set(
                &keys::workflow_state(&state.execution_id),
                raw,
                Some(self.config.state_ttl),
            )
            .await
    }

    fn emit(&self, execution_id: &str, event_type: &str, data: Value) {
        self.bus
            .publish(BusEvent::new(event_type, execution_id, data));
    }
}

/// Run one step to a terminal outcome, retrying per policy.
#[allow(clippy::too_many_arguments)]
async fn execute_step(
    inner: Arc<EngineInner>,
    execution_id: String,
    user_id: String,
    step: WorkflowStep,
    inputs: Map<String, Value>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> StepTaskResult {
    let started = std::time::Instant::now();
    let mut retry_count = 0u32;

    let finish = |outcome: StepOutcome, retry_count: u32| StepTaskResult {
        step_id: step.id.clone(),
        outcome,
        retry_count,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    // Resolve the agent: explicit ID or default for the type.
    let agent_id = match &step.agent_id {
        Some(id) => id.clone(),
        None => match inner.registry.resolve_default(step.agent_type) {
            Some(record) => record.id,
            None => {
                return finish(
                    StepOutcome::Failed(format!(
                        "no agent registered for type '{}'",
                        step.agent_type
                    )),
                    retry_count,
                )
            }
        },
    };

    // Render the prompt: template reference or inline with {{var}}
    // substitution over the gathered inputs.
    let prompt = if let Some(template_id) = &step.prompt_template_id {
        match inner.templates.render(template_id, &inputs).await {
            Ok(prompt) => prompt,
            Err(err) => return finish(StepOutcome::Failed(err.to_string()), retry_count),
        }
    } else {
        let inline = step.prompt.clone().unwrap_or_default();
        match interpolate::interpolate(&inline, &inputs, &[]) {
            Ok(prompt) => prompt,
            Err(err) => return finish(StepOutcome::Failed(err.to_string()), retry_count),
        }
    };

    let mut attempt = 0u32;
    let outcome = loop {
        let input = AgentExecutionInput::new(
            prompt.clone(),
            AgentContext::for_user(user_id.clone()).with_execution(
                ExecutionId::parse(&execution_id)
                    .unwrap_or_else(|| ExecutionId::from_name(&execution_id)),
            ),
        )
        .with_timeout(timeout);

        let invocation = inner.registry.execute(&agent_id, input);
        let result = tokio::select! {
            result = invocation => result,
            _ = cancel.cancelled() => break StepOutcome::Failed("workflow cancelled".into()),
        };

        match result {
            Ok(output) if output.success => {
                break StepOutcome::Completed(output.result.unwrap_or(Value::Null));
            }
            Ok(output) => {
                let message = output.error.unwrap_or_else(|| "agent call failed".into());
                if attempt < retry_policy.max_retries {
                    tokio::time::sleep(retry_policy.delay(attempt)).await;
                    attempt += 1;
                    retry_count = attempt;
                    continue;
                }
                break StepOutcome::Failed(message);
            }
            Err(err) if err.is_transient() && attempt < retry_policy.max_retries => {
                tokio::time::sleep(retry_policy.delay(attempt)).await;
                attempt += 1;
                retry_count = attempt;
            }
            Err(err) => break StepOutcome::Failed(err.to_string()),
        }
    };

    // On success, publish the result into the context: the implicit
    // steps.<id>.result slot plus any configured outputs.
    if let StepOutcome::Completed(result) = &outcome {
        let implicit = format!("steps.{}.result", step.id);
        if let Err(err) = inner
            .contexts
            .set_value(&execution_id, &implicit, result.clone())
            .await
        {
            warn!(execution_id = %execution_id, step_id = %step.id, error = %err, "failed to record step result");
        }
        for output in &step.outputs {
            let value = match &output.field {
                Some(field) => paths::get_path(result, field)
                    .cloned()
                    .unwrap_or(Value::Null),
                None => result.clone(),
            };
            if let Err(err) = inner
                .contexts
                .set_value(&execution_id, &output.path, value)
                .await
            {
                return finish(
                    StepOutcome::Failed(format!(
                        "failed to write output '{}': {}",
                        output.path, err
                    )),
                    retry_count,
                );
            }
        }
    }

    finish(outcome, retry_count)
}
