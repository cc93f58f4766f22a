//! Discussion loop tests: strategies, convergence, facilitator parsing,
//! and validation ordering.

use serde_json::json;
use std::sync::Arc;

use maestro_agents::{AgentRegistry, AgentType};
use maestro_core::AgentExecutor;
use maestro_events::EventBus;
use maestro_patterns::{
    ConsensusStrategy, DiscussionOptions, DiscussionService, Participant,
};
use maestro_store::{MemoryBackend, StoreBackend};
use maestro_templates::TemplateStore;
use maestro_testing::ScriptedExecutor;

struct Harness {
    service: DiscussionService,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
}

async fn harness() -> Harness {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(AgentRegistry::new(store.clone()));
    let templates = Arc::new(TemplateStore::new(store).await.unwrap());
    let service = DiscussionService::new(registry.clone(), templates, bus.clone());
    Harness {
        service,
        registry,
        bus,
    }
}

async fn register(harness: &Harness, id: &str, executor: Arc<dyn AgentExecutor>) {
    harness
        .registry
        .register(AgentType::Llm, id, vec![], executor, Some(id.to_string()))
        .await
        .unwrap();
}

fn participant(id: &str, agent_id: &str, weight: Option<f64>) -> Participant {
    Participant {
        id: Some(id.to_string()),
        agent_id: agent_id.to_string(),
        role: format!("{} role", id),
        perspective: None,
        weight,
    }
}

/// S7: the facilitator strategy without a facilitator agent fails
/// validation before any participant is invoked.
#[tokio::test]
async fn test_facilitator_strategy_requires_agent_id() {
    let harness = harness().await;
    let executor = Arc::new(ScriptedExecutor::new().then_success(json!("never called")));
    register(&harness, "p1", executor.clone()).await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Facilitator,
        facilitator_agent_id: None,
        ..Default::default()
    };
    let err = harness
        .service
        .run("topic", vec![participant("a", "p1", None)], options, "u1")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(executor.call_count(), 0);
}

/// Majority strategy averages the extracted agreement scores and
/// converges once the threshold is crossed.
#[tokio::test]
async fn test_majority_consensus_converges() {
    let harness = harness().await;
    register(
        &harness,
        "optimist",
        Arc::new(
            ScriptedExecutor::new()
                .then_success(json!("Strongly in favor. agreement: 9/10")),
        ),
    )
    .await;
    register(
        &harness,
        "skeptic",
        Arc::new(
            ScriptedExecutor::new().then_success(json!("Some doubts remain. agreement: 7/10")),
        ),
    )
    .await;

    let mut events = harness.bus.subscribe("discussion.*");
    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Majority,
        convergence_threshold: 0.8,
        max_rounds: 3,
        ..Default::default()
    };
    let result = harness
        .service
        .run(
            "should we ship",
            vec![
                participant("a", "optimist", None),
                participant("b", "skeptic", None),
            ],
            options,
            "u1",
        )
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds.len(), 1);
    assert!((result.consensus_score - 0.8).abs() < 1e-9);
    assert_eq!(result.rounds[0].contributions.len(), 2);

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        types.push(event.event_type);
    }
    assert!(types.contains(&"discussion.round-started".to_string()));
    assert!(types.contains(&"discussion.contribution".to_string()));
    assert!(types.contains(&"discussion.round-completed".to_string()));
    assert!(types.contains(&"discussion.converged".to_string()));
    assert_eq!(types.last().unwrap(), "discussion.completed");
}

/// Weighted strategy favors heavier participants.
#[tokio::test]
async fn test_weighted_consensus() {
    let harness = harness().await;
    register(
        &harness,
        "lead",
        Arc::new(ScriptedExecutor::new().then_success(json!("agree fully. agreement: 10/10"))),
    )
    .await;
    register(
        &harness,
        "junior",
        Arc::new(ScriptedExecutor::new().then_success(json!("not convinced. agreement: 2/10"))),
    )
    .await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Weighted,
        convergence_threshold: 0.8,
        max_rounds: 1,
        ..Default::default()
    };
    let result = harness
        .service
        .run(
            "topic",
            vec![
                participant("lead", "lead", Some(3.0)),
                participant("junior", "junior", Some(1.0)),
            ],
            options,
            "u1",
        )
        .await
        .unwrap();

    // (1.0*3 + 0.2*1) / 4 = 0.8
    assert!((result.consensus_score - 0.8).abs() < 1e-9);
    assert!(result.converged);
}

/// Unanimous strategy penalizes outliers, so the discussion runs all
/// rounds without converging.
#[tokio::test]
async fn test_unanimous_outlier_blocks_convergence() {
    let harness = harness().await;
    register(
        &harness,
        "agreeable",
        Arc::new(ScriptedExecutor::new().then_success(json!("sure. agreement: 9/10"))),
    )
    .await;
    register(
        &harness,
        "holdout",
        Arc::new(ScriptedExecutor::new().then_success(json!("no. agreement: 3/10"))),
    )
    .await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Unanimous,
        convergence_threshold: 0.8,
        max_rounds: 2,
        ..Default::default()
    };
    let result = harness
        .service
        .run(
            "topic",
            vec![
                participant("a", "agreeable", None),
                participant("b", "holdout", None),
            ],
            options,
            "u1",
        )
        .await
        .unwrap();

    assert!(!result.converged);
    assert_eq!(result.rounds.len(), 2);
    // min 0.3 penalized to 0.15
    assert!((result.consensus_score - 0.15).abs() < 1e-9);
}

/// The facilitator's JSON may be embedded in a longer reply; its
/// synthesis and score drive the round.
#[tokio::test]
async fn test_facilitator_json_in_prose() {
    let harness = harness().await;
    register(
        &harness,
        "p1",
        Arc::new(ScriptedExecutor::new().then_success(json!("looks good. agreement: 6/10"))),
    )
    .await;
    register(
        &harness,
        "fac",
        Arc::new(ScriptedExecutor::new().then_success(json!(
            "Happy to summarize!\n\n{\"synthesis\": \"broad agreement on scope\", \
             \"consensusScore\": 0.9, \"agreements\": [\"scope\"], \
             \"disagreements\": [], \"nextSteps\": [\"draft plan\"]}\n\nLet me know."
        ))),
    )
    .await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Facilitator,
        facilitator_agent_id: Some("fac".into()),
        convergence_threshold: 0.8,
        max_rounds: 3,
        ..Default::default()
    };
    let result = harness
        .service
        .run("topic", vec![participant("a", "p1", None)], options, "u1")
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds.len(), 1);
    assert!((result.consensus_score - 0.9).abs() < 1e-9);
    assert_eq!(
        result.final_synthesis.as_deref(),
        Some("broad agreement on scope")
    );
}

/// A facilitator that replies without JSON falls back to majority
/// scoring for the round.
#[tokio::test]
async fn test_facilitator_parse_failure_falls_back_to_majority() {
    let harness = harness().await;
    register(
        &harness,
        "p1",
        Arc::new(ScriptedExecutor::new().then_success(json!("fine. agreement: 9/10"))),
    )
    .await;
    register(
        &harness,
        "fac",
        Arc::new(ScriptedExecutor::new().then_success(json!("I prefer prose, no JSON today"))),
    )
    .await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Facilitator,
        facilitator_agent_id: Some("fac".into()),
        convergence_threshold: 0.8,
        max_rounds: 1,
        ..Default::default()
    };
    let result = harness
        .service
        .run("topic", vec![participant("a", "p1", None)], options, "u1")
        .await
        .unwrap();

    // Majority over one participant: 0.9
    assert!((result.consensus_score - 0.9).abs() < 1e-9);
    assert!(result.final_synthesis.is_none());
}

/// Later rounds see the previous round's contributions in their prompt.
#[tokio::test]
async fn test_rounds_thread_previous_contributions() {
    let harness = harness().await;
    let executor = Arc::new(
        ScriptedExecutor::new()
            .then_success(json!("first position. agreement: 5/10"))
            .then_success(json!("updated position. agreement: 9/10")),
    );
    register(&harness, "p1", executor.clone()).await;

    let options = DiscussionOptions {
        consensus_strategy: ConsensusStrategy::Majority,
        convergence_threshold: 0.8,
        max_rounds: 2,
        ..Default::default()
    };
    let result = harness
        .service
        .run("topic", vec![participant("a", "p1", None)], options, "u1")
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds.len(), 2);

    let prompts = executor.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("(none)"));
    assert!(prompts[1].contains("first position"));
}
