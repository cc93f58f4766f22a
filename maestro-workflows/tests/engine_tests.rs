//! End-to-end workflow engine tests: parallelism, skip propagation,
//! conditions, admission queueing, pause/resume, and cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use maestro_agents::{AgentRegistry, AgentType};
use maestro_context::ContextStore;
use maestro_events::{BusEvent, EventBus};
use maestro_store::{MemoryBackend, StoreBackend};
use maestro_templates::TemplateStore;
use maestro_testing::{EchoExecutor, ScriptedExecutor};
use maestro_workflows::{
    InputSource, StepStatus, WorkflowDefinition, WorkflowEngine, WorkflowEngineConfig,
    WorkflowState, WorkflowStatus, WorkflowStep,
};

struct Harness {
    engine: WorkflowEngine,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    contexts: Arc<ContextStore>,
}

async fn harness_with(config: WorkflowEngineConfig) -> Harness {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(AgentRegistry::new(store.clone()));
    let templates = Arc::new(TemplateStore::new(store.clone()).await.unwrap());
    let contexts = Arc::new(ContextStore::new(store.clone()));
    let engine = WorkflowEngine::with_config(
        store,
        bus.clone(),
        registry.clone(),
        templates,
        contexts.clone(),
        config,
    );
    Harness {
        engine,
        registry,
        bus,
        contexts,
    }
}

async fn harness() -> Harness {
    harness_with(WorkflowEngineConfig::default()).await
}

async fn register_echo(harness: &Harness, id: &str, delay: Option<Duration>) {
    let executor = match delay {
        Some(delay) => EchoExecutor::with_delay(delay),
        None => EchoExecutor::new(),
    };
    harness
        .registry
        .register(
            AgentType::Custom,
            id,
            vec![],
            Arc::new(executor),
            Some(id.to_string()),
        )
        .await
        .unwrap();
}

async fn wait_terminal(engine: &WorkflowEngine, execution_id: &str) -> WorkflowState {
    for _ in 0..600 {
        if let Some(state) = engine.status(execution_id).await.unwrap() {
            if state.status.is_terminal() {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} did not reach a terminal state", execution_id);
}

fn events_for<'a>(events: &'a [BusEvent], execution_id: &str) -> Vec<&'a BusEvent> {
    events
        .iter()
        .filter(|e| e.execution_id == execution_id)
        .collect()
}

/// Diamond A -> {B, C} -> D: B and C run in parallel and D sees both
/// results through its inputs.
#[tokio::test]
async fn test_diamond_workflow_runs_parallel_branches() {
    let harness = harness().await;
    register_echo(&harness, "fast", None).await;
    register_echo(&harness, "slow", Some(Duration::from_millis(200))).await;

    let definition = WorkflowDefinition::new("diamond", "diamond")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("A"),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("B")
                .with_dependencies(["a"]),
        )
        .with_step(
            WorkflowStep::new("c", "c", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("C")
                .with_dependencies(["a"]),
        )
        .with_step(
            WorkflowStep::new("d", "d", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("{{b}}|{{c}}")
                .with_input(
                    "b",
                    InputSource::Step {
                        step_id: "b".into(),
                        field: None,
                    },
                )
                .with_input(
                    "c",
                    InputSource::Step {
                        step_id: "c".into(),
                        field: None,
                    },
                )
                .with_dependencies(["b", "c"]),
        );

    let started = Instant::now();
    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;
    let elapsed = started.elapsed();

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(final_state.progress, 100);
    // B and C overlapped: well under the 400ms a serial run would take.
    assert!(
        elapsed < Duration::from_millis(500),
        "took {:?}, branches did not run in parallel",
        elapsed
    );
    assert_eq!(
        final_state.steps["d"].result,
        Some(serde_json::json!("B|C"))
    );
}

/// S2: a failed dependency skips its dependents; the workflow fails
/// with exactly one step:failed and no step:started for the dependent.
#[tokio::test]
async fn test_failed_dependency_skips_downstream() {
    let harness = harness().await;
    harness
        .registry
        .register(
            AgentType::Custom,
            "broken",
            vec![],
            Arc::new(ScriptedExecutor::new().then_failure("simulated failure")),
            Some("broken".to_string()),
        )
        .await
        .unwrap();
    register_echo(&harness, "fast", None).await;

    let mut all_events = harness.bus.subscribe("workflow.*");
    let definition = WorkflowDefinition::new("skip", "skip")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("broken")
                .with_prompt("A"),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("B")
                .with_dependencies(["a"]),
        );

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.status, WorkflowStatus::Failed);
    assert_eq!(final_state.steps["a"].status, StepStatus::Failed);
    assert_eq!(final_state.steps["b"].status, StepStatus::Skipped);

    // The terminal event publishes right after the terminal state write.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = Vec::new();
    while let Ok(event) = all_events.try_recv() {
        events.push(event);
    }
    let mine = events_for(&events, &state.execution_id);
    let failed_steps: Vec<_> = mine
        .iter()
        .filter(|e| e.event_type == "workflow.step.failed")
        .collect();
    assert_eq!(failed_steps.len(), 1);
    assert_eq!(failed_steps[0].data["stepId"], "a");
    let started_b = mine
        .iter()
        .filter(|e| e.event_type == "workflow.step.started" && e.data["stepId"] == "b")
        .count();
    assert_eq!(started_b, 0);
    // Exactly one terminal event closes the stream.
    let terminal = mine.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal, 1);
}

/// continueOnError on the failed dependency lets dependents run.
#[tokio::test]
async fn test_continue_on_error_allows_dependents() {
    let harness = harness().await;
    harness
        .registry
        .register(
            AgentType::Custom,
            "broken",
            vec![],
            Arc::new(ScriptedExecutor::new().then_failure("nope")),
            Some("broken".to_string()),
        )
        .await
        .unwrap();
    register_echo(&harness, "fast", None).await;

    let definition = WorkflowDefinition::new("coe", "coe")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("broken")
                .with_prompt("A")
                .continue_on_error(),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("B")
                .with_dependencies(["a"]),
        );

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.steps["a"].status, StepStatus::Failed);
    assert_eq!(final_state.steps["b"].status, StepStatus::Completed);
    // A step still failed, so the workflow is failed overall.
    assert_eq!(final_state.status, WorkflowStatus::Failed);
}

/// A false condition skips the step without blocking dependents.
#[tokio::test]
async fn test_condition_false_skips_step_only() {
    let harness = harness().await;
    register_echo(&harness, "fast", None).await;

    let definition = WorkflowDefinition::new("cond", "cond")
        .with_step(
            WorkflowStep::new("gate", "gate", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("gated")
                .with_condition("context.tier === \"premium\""),
        )
        .with_step(
            WorkflowStep::new("after", "after", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("after")
                .with_dependencies(["gate"]),
        );

    let state = harness
        .engine
        .submit(
            definition,
            "u1",
            Some(serde_json::json!({"tier": "free"})),
        )
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    let gate = &final_state.steps["gate"];
    assert_eq!(gate.status, StepStatus::Skipped);
    assert_eq!(
        gate.result,
        Some(serde_json::json!({"skipped": true, "reason": "condition"}))
    );
    assert_eq!(final_state.steps["after"].status, StepStatus::Completed);
}

/// Per-step retry policy: transient errors retry with the count recorded.
#[tokio::test]
async fn test_step_retry_policy() {
    let harness = harness().await;
    harness
        .registry
        .register(
            AgentType::Custom,
            "flaky",
            vec![],
            Arc::new(
                ScriptedExecutor::new()
                    .then(maestro_testing::ScriptedReply::TransientError(
                        "connection reset".into(),
                    ))
                    .then_success(serde_json::json!("recovered")),
            ),
            Some("flaky".to_string()),
        )
        .await
        .unwrap();

    let mut step = WorkflowStep::new("a", "a", AgentType::Custom)
        .with_agent("flaky")
        .with_prompt("A");
    step.retry_policy = Some(maestro_workflows::RetryPolicy {
        max_retries: 2,
        initial_delay_ms: 10,
        backoff_multiplier: 2.0,
        max_delay_ms: 100,
    });
    let definition = WorkflowDefinition::new("retry", "retry").with_step(step);

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    let step_state = &final_state.steps["a"];
    assert_eq!(step_state.status, StepStatus::Completed);
    assert_eq!(step_state.retry_count, 1);
    assert_eq!(step_state.result, Some(serde_json::json!("recovered")));
}

/// Admission queue: with a single workflow slot the second submission
/// queues with a position, then runs when the slot frees.
#[tokio::test]
async fn test_admission_queue() {
    let harness = harness_with(WorkflowEngineConfig {
        max_concurrent_workflows: 1,
        ..Default::default()
    })
    .await;
    register_echo(&harness, "slow", Some(Duration::from_millis(200))).await;

    let slow_definition = |id: &str| {
        WorkflowDefinition::new(id, id).with_step(
            WorkflowStep::new("s", "s", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("S"),
        )
    };

    let first = harness
        .engine
        .submit(slow_definition("wf1"), "u1", None)
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Running);

    let second = harness
        .engine
        .submit(slow_definition("wf2"), "u1", None)
        .await
        .unwrap();
    assert_eq!(second.status, WorkflowStatus::Queued);
    assert_eq!(second.queue_position, Some(1));

    let first_final = wait_terminal(&harness.engine, &first.execution_id).await;
    let second_final = wait_terminal(&harness.engine, &second.execution_id).await;
    assert_eq!(first_final.status, WorkflowStatus::Completed);
    assert_eq!(second_final.status, WorkflowStatus::Completed);
}

/// With queueing disabled, excess submissions fail fast with a
/// capacity error.
#[tokio::test]
async fn test_capacity_fail_fast_when_queue_disabled() {
    let harness = harness_with(WorkflowEngineConfig {
        max_concurrent_workflows: 1,
        queue_enabled: false,
        ..Default::default()
    })
    .await;
    register_echo(&harness, "slow", Some(Duration::from_millis(300))).await;

    let definition = |id: &str| {
        WorkflowDefinition::new(id, id).with_step(
            WorkflowStep::new("s", "s", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("S"),
        )
    };

    let first = harness
        .engine
        .submit(definition("wf1"), "u1", None)
        .await
        .unwrap();
    let err = harness
        .engine
        .submit(definition("wf2"), "u1", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    wait_terminal(&harness.engine, &first.execution_id).await;
}

/// S8: cancelling mid-run drains without dispatching new steps and
/// emits a terminal cancelled event with completedAt set.
#[tokio::test]
async fn test_cancellation_drains() {
    let harness = harness().await;
    register_echo(&harness, "slow", Some(Duration::from_secs(5))).await;
    register_echo(&harness, "fast", None).await;

    let mut events = harness.bus.subscribe("workflow.*");
    let definition = WorkflowDefinition::new("cancel", "cancel")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("A"),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("B")
                .with_dependencies(["a"]),
        );

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();

    // Let A start, then cancel.
    for _ in 0..100 {
        let current = harness
            .engine
            .status(&state.execution_id)
            .await
            .unwrap()
            .unwrap();
        if current.steps["a"].status == StepStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.engine.cancel(&state.execution_id).await.unwrap());

    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;
    assert_eq!(final_state.status, WorkflowStatus::Cancelled);
    assert!(final_state.completed_at.is_some());
    assert!(final_state.all_steps_terminal());
    // B never started.
    assert_eq!(final_state.steps["b"].status, StepStatus::Skipped);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    let mine = events_for(&collected, &state.execution_id);
    assert!(mine
        .iter()
        .any(|e| e.event_type == "workflow.cancelled"));
    let started_b = mine
        .iter()
        .filter(|e| e.event_type == "workflow.step.started" && e.data["stepId"] == "b")
        .count();
    assert_eq!(started_b, 0);

    // Cancelling a terminal execution is a no-op returning false.
    assert!(!harness.engine.cancel(&state.execution_id).await.unwrap());
}

/// Pause between rounds stops new dispatch, snapshots the context, and
/// resume picks the workflow back up.
#[tokio::test]
async fn test_pause_and_resume() {
    let harness = harness().await;
    register_echo(&harness, "slow", Some(Duration::from_millis(250))).await;
    register_echo(&harness, "fast", None).await;

    let definition = WorkflowDefinition::new("pause", "pause")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("slow")
                .with_prompt("A"),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("B")
                .with_dependencies(["a"]),
        );

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    // Pause once A is actually in flight.
    for _ in 0..100 {
        let current = harness
            .engine
            .status(&state.execution_id)
            .await
            .unwrap()
            .unwrap();
        if current.steps["a"].status == StepStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.engine.pause(&state.execution_id).await.unwrap());

    // A drains; B must not start while paused.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let paused = harness
        .engine
        .status(&state.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.steps["a"].status, StepStatus::Completed);
    assert_eq!(paused.steps["b"].status, StepStatus::Pending);
    let snapshots = harness
        .contexts
        .list_snapshots(&state.execution_id)
        .await
        .unwrap();
    assert!(snapshots.iter().any(|s| s.label == "pause"));

    assert!(harness.engine.resume(&state.execution_id).await.unwrap());
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;
    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(final_state.steps["b"].status, StepStatus::Completed);
}

/// Step outputs land at their configured context paths and feed
/// downstream prompts through context inputs.
#[tokio::test]
async fn test_outputs_flow_through_context() {
    let harness = harness().await;
    register_echo(&harness, "fast", None).await;

    let definition = WorkflowDefinition::new("outputs", "outputs")
        .with_step(
            WorkflowStep::new("a", "a", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("first-result")
                .with_output("artifacts.first", None),
        )
        .with_step(
            WorkflowStep::new("b", "b", AgentType::Custom)
                .with_agent("fast")
                .with_prompt("got: {{prev}}")
                .with_input(
                    "prev",
                    InputSource::Context {
                        path: "artifacts.first".into(),
                    },
                )
                .with_dependencies(["a"]),
        );

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert_eq!(
        final_state.steps["b"].result,
        Some(serde_json::json!("got: first-result"))
    );
}

/// With a per-workflow cap of 2, at most two steps are ever running
/// simultaneously.
#[tokio::test]
async fn test_parallel_step_cap_is_respected() {
    use async_trait::async_trait;
    use maestro_core::{
        AgentExecutionInput, AgentExecutionOutput, AgentExecutor, Result as MaestroResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl AgentExecutor for CountingExecutor {
        async fn execute(
            &self,
            _input: AgentExecutionInput,
        ) -> MaestroResult<AgentExecutionOutput> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentExecutionOutput::success(serde_json::json!("done"), 80))
        }
    }

    let harness = harness().await;
    let executor = Arc::new(CountingExecutor {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    harness
        .registry
        .register(
            AgentType::Custom,
            "counter",
            vec![],
            executor.clone(),
            Some("counter".to_string()),
        )
        .await
        .unwrap();

    let mut definition = WorkflowDefinition::new("capped", "capped");
    definition.max_parallel_steps = Some(2);
    for i in 0..5 {
        definition = definition.with_step(
            WorkflowStep::new(format!("s{}", i), format!("s{}", i), AgentType::Custom)
                .with_agent("counter")
                .with_prompt("work"),
        );
    }

    let state = harness
        .engine
        .submit(definition, "u1", None)
        .await
        .unwrap();
    let final_state = wait_terminal(&harness.engine, &state.execution_id).await;

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert!(executor.peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
}

/// User index records submissions.
#[tokio::test]
async fn test_user_execution_index() {
    let harness = harness().await;
    register_echo(&harness, "fast", None).await;

    let definition = WorkflowDefinition::new("idx", "idx").with_step(
        WorkflowStep::new("a", "a", AgentType::Custom)
            .with_agent("fast")
            .with_prompt("A"),
    );
    let state = harness
        .engine
        .submit(definition, "user-7", None)
        .await
        .unwrap();
    wait_terminal(&harness.engine, &state.execution_id).await;

    let executions = harness.engine.user_executions("user-7").await.unwrap();
    assert!(executions.contains(&state.execution_id));
}
