//! ABOUTME: DiscussionService — multi-round multi-participant consensus loop
//! ABOUTME: Parallel contributions, agreement extraction, pluggable consensus strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use maestro_agents::AgentRegistry;
use maestro_core::{AgentContext, AgentExecutionInput, ExecutionId, MaestroError, Result};
use maestro_events::{BusEvent, EventBus};
use maestro_templates::TemplateStore;

use crate::extract::{extract_agreement_score, extract_first_json_object};

/// How a round's consensus score is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusStrategy {
    /// Minimum score; outliers are penalized
    Unanimous,
    /// Arithmetic mean
    Majority,
    /// Weighted mean over participant weights
    Weighted,
    /// A facilitator agent synthesizes and scores the round
    Facilitator,
}

/// One discussion participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl Participant {
    fn participant_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("participant-{}", index + 1))
    }
}

/// Discussion options
#[derive(Debug, Clone)]
pub struct DiscussionOptions {
    pub max_rounds: u32,
    pub convergence_threshold: f64,
    pub consensus_strategy: ConsensusStrategy,
    /// Required when the strategy is Facilitator
    pub facilitator_agent_id: Option<String>,
    pub max_parallel_participants: usize,
    pub participant_timeout: Duration,
    pub participant_template: String,
    pub facilitator_template: String,
}

impl Default for DiscussionOptions {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            convergence_threshold: 0.8,
            consensus_strategy: ConsensusStrategy::Majority,
            facilitator_agent_id: None,
            max_parallel_participants: 5,
            participant_timeout: Duration::from_secs(120),
            participant_template: "discussion-participant".to_string(),
            facilitator_template: "discussion-facilitator".to_string(),
        }
    }
}

/// One participant's contribution in a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    #[serde(rename = "participantId")]
    pub participant_id: String,
    pub role: String,
    pub content: String,
    #[serde(rename = "agreementScore")]
    pub agreement_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// One completed round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionRound {
    pub round: u32,
    pub contributions: Vec<Contribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    #[serde(rename = "consensusScore")]
    pub consensus_score: f64,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Final discussion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionResult {
    pub id: String,
    pub topic: String,
    pub rounds: Vec<DiscussionRound>,
    #[serde(rename = "consensusScore")]
    pub consensus_score: f64,
    pub converged: bool,
    #[serde(rename = "finalSynthesis", default, skip_serializing_if = "Option::is_none")]
    pub final_synthesis: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

/// Most participants accepted in one discussion
pub const MAX_PARTICIPANTS: usize = 10;

/// Multi-round multi-agent discussion driving toward consensus.
pub struct DiscussionService {
    registry: Arc<AgentRegistry>,
    templates: Arc<TemplateStore>,
    bus: Arc<EventBus>,
}

impl DiscussionService {
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

    /// Validate inputs; runs before any participant is invoked
    fn validate(participants: &[Participant], options: &DiscussionOptions) -> Result<()> {
        if participants.is_empty() {
            return Err(MaestroError::validation_field(
                "discussion needs at least one participant",
                "participants",
            ));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(MaestroError::ParticipantLimit {
                message: format!(
                    "discussion accepts at most {} participants",
                    MAX_PARTICIPANTS
                ),
            });
        }
        if options.consensus_strategy == ConsensusStrategy::Facilitator
            && options.facilitator_agent_id.is_none()
        {
            return Err(MaestroError::validation_field(
                "facilitator strategy requires facilitatorAgentId",
                "facilitatorAgentId",
            ));
        }
        if options.max_rounds == 0 {
            return Err(MaestroError::validation_field(
                "maxRounds must be at least 1",
                "maxRounds",
            ));
        }
        Ok(())
    }

    /// Run the discussion to convergence or round exhaustion
    pub async fn run(
        &self,
        topic: &str,
        participants: Vec<Participant>,
        options: DiscussionOptions,
        user_id: &str,
    ) -> Result<DiscussionResult> {
        Self::validate(&participants, &options)?;

        let id = ExecutionId::new().to_string();
        let execution = ExecutionId::parse(&id).unwrap_or_default();
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        info!(execution_id = %id, topic, "discussion started");

        let mut rounds: Vec<DiscussionRound> = Vec::new();
        let mut converged = false;

        for round in 1..=options.max_rounds {
            self.emit(&id, "discussion.round-started", json!({ "round": round }));
            let round_started = std::time::Instant::now();

            let contributions = self
                .gather_contributions(
                    &id,
                    topic,
                    &participants,
                    &options,
                    rounds.last(),
                    round,
                    user_id,
                    execution,
                )
                .await?;
            if contributions.is_empty() {
                return Err(MaestroError::Execution {
                    message: format!("no participant contributed in round {}", round),
                });
            }

            let (consensus_score, synthesis) = self
                .score_round(&id, topic, round, &participants, &contributions, &options, user_id, execution)
                .await;

            let record = DiscussionRound {
                round,
                contributions,
                synthesis,
                consensus_score,
                duration_ms: round_started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            };
            self.emit(
                &id,
                "discussion.round-completed",
                json!({ "round": round, "consensusScore": consensus_score }),
            );
            rounds.push(record);

            if converged_now(&rounds, &options) {
                converged = true;
                self.emit(
                    &id,
                    "discussion.converged",
                    json!({ "round": round, "consensusScore": consensus_score }),
                );
                break;
            }
        }

        let last = rounds.last().expect("at least one round ran");
        let result = DiscussionResult {
            id: id.clone(),
            topic: topic.to_string(),
            consensus_score: last.consensus_score,
            converged,
            final_synthesis: last.synthesis.clone(),
            rounds,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        };
        self.emit(
            &id,
            "discussion.completed",
            json!({
                "converged": result.converged,
                "consensusScore": result.consensus_score,
                "rounds": result.rounds.len(),
            }),
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn gather_contributions(
        &self,
        id: &str,
        topic: &str,
        participants: &[Participant],
        options: &DiscussionOptions,
        previous: Option<&DiscussionRound>,
        round: u32,
        user_id: &str,
        execution: ExecutionId,
    ) -> Result<Vec<Contribution>> {
        let previous_synthesis = previous
            .and_then(|r| r.synthesis.clone())
            .unwrap_or_else(|| "(first round)".to_string());
        let previous_contributions = previous
            .map(|r| {
                r.contributions
                    .iter()
                    .map(|c| format!("[{}] {}", c.role, c.content))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
            .unwrap_or_else(|| "(none)".to_string());

        let cap = options.max_parallel_participants.max(1);
        let mut contributions: Vec<Option<Contribution>> = vec![None; participants.len()];

        for (batch_index, batch) in participants.chunks(cap).enumerate() {
            let batch_start = batch_index * cap;
            let mut join_set = JoinSet::new();
            for (offset, participant) in batch.iter().enumerate() {
                let index = batch_start + offset;
                let mut vars = Map::new();
                vars.insert("topic".into(), json!(topic));
                vars.insert("role".into(), json!(participant.role));
                vars.insert(
                    "perspective".into(),
                    json!(participant.perspective.clone().unwrap_or_default()),
                );
                vars.insert("round".into(), json!(round));
                vars.insert("previous_synthesis".into(), json!(previous_synthesis));
                vars.insert(
                    "previous_contributions".into(),
                    json!(previous_contributions),
                );

                let prompt = self
                    .templates
                    .render(&options.participant_template, &vars)
                    .await?;
                let registry = self.registry.clone();
                let participant = participant.clone();
                let user_id = user_id.to_string();
                let timeout = options.participant_timeout;
                join_set.spawn(async move {
                    let input = AgentExecutionInput::new(
                        prompt,
                        AgentContext::for_user(user_id).with_execution(execution),
                    )
                    .with_timeout(timeout);
                    let result = registry.execute(&participant.agent_id, input).await;
                    (index, participant, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (index, participant, result) = match joined {
                    Ok(entry) => entry,
                    Err(join_err) => {
                        warn!(execution_id = %id, error = %join_err, "participant task panicked");
                        continue;
                    }
                };
                match result {
                    Ok(output) if output.success => {
                        let content = output.result_text();
                        let contribution = Contribution {
                            participant_id: participant.participant_id(index),
                            role: participant.role.clone(),
                            agreement_score: extract_agreement_score(&content),
                            content,
                            timestamp: Utc::now(),
                        };
                        self.emit(
                            id,
                            "discussion.contribution",
                            json!({
                                "round": round,
                                "participantId": contribution.participant_id,
                                "agreementScore": contribution.agreement_score,
                            }),
                        );
                        contributions[index] = Some(contribution);
                    }
                    Ok(output) => {
                        warn!(
                            execution_id = %id,
                            participant = %participant.participant_id(index),
                            error = output.error.as_deref().unwrap_or("unknown"),
                            "participant failed"
                        );
                    }
                    Err(err) => {
                        warn!(
                            execution_id = %id,
                            participant = %participant.participant_id(index),
                            error = %err,
                            "participant errored"
                        );
                    }
                }
            }
        }

        Ok(contributions.into_iter().flatten().collect())
    }

    /// Score the round per the configured strategy; returns the score
    /// and an optional synthesis.
    #[allow(clippy::too_many_arguments)]
    async fn score_round(
        &self,
        id: &str,
        topic: &str,
        round: u32,
        participants: &[Participant],
        contributions: &[Contribution],
        options: &DiscussionOptions,
        user_id: &str,
        execution: ExecutionId,
    ) -> (f64, Option<String>) {
        match options.consensus_strategy {
            ConsensusStrategy::Unanimous => (unanimous_score(contributions), None),
            ConsensusStrategy::Majority => (majority_score(contributions), None),
            ConsensusStrategy::Weighted => {
                (weighted_score(participants, contributions), None)
            }
            ConsensusStrategy::Facilitator => {
                match self
                    .facilitate(id, topic, round, contributions, options, user_id, execution)
                    .await
                {
                    Some((score, synthesis)) => (score, synthesis),
                    None => {
                        debug!(execution_id = %id, round, "facilitator unusable, falling back to majority");
                        (majority_score(contributions), None)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn facilitate(
        &self,
        id: &str,
        topic: &str,
        round: u32,
        contributions: &[Contribution],
        options: &DiscussionOptions,
        user_id: &str,
        execution: ExecutionId,
    ) -> Option<(f64, Option<String>)> {
        let facilitator = options.facilitator_agent_id.as_deref()?;
        let contributions_text = contributions
            .iter()
            .map(|c| {
                format!(
                    "[{} | agreement {:.1}/10] {}",
                    c.role,
                    c.agreement_score * 10.0,
                    c.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut vars = Map::new();
        vars.insert("topic".into(), json!(topic));
        vars.insert("round".into(), json!(round));
        vars.insert("contributions".into(), json!(contributions_text));
        let prompt = match self
            .templates
            .render(&options.facilitator_template, &vars)
            .await
        {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(execution_id = %id, error = %err, "facilitator template failed");
                return None;
            }
        };

        let input = AgentExecutionInput::new(
            prompt,
            AgentContext::for_user(user_id).with_execution(execution),
        )
        .with_timeout(options.participant_timeout);
        let reply = match self.registry.execute(facilitator, input).await {
            Ok(output) if output.success => output.result_text(),
            Ok(output) => {
                warn!(
                    execution_id = %id,
                    error = output.error.as_deref().unwrap_or("unknown"),
                    "facilitator call failed"
                );
                return None;
            }
            Err(err) => {
                warn!(execution_id = %id, error = %err, "facilitator call errored");
                return None;
            }
        };

        // The facilitator's JSON may sit inside a longer reply.
        let parsed = extract_first_json_object(&reply)?;
        let score = parsed.get("consensusScore")?.as_f64()?.clamp(0.0, 1.0);
        let synthesis = parsed
            .get("synthesis")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some((score, synthesis))
    }

    fn emit(&self, id: &str, event_type: &str, data: Value) {
        self.bus.publish(BusEvent::new(event_type, id, data));
    }
}

fn unanimous_score(contributions: &[Contribution]) -> f64 {
    let min = contributions
        .iter()
        .map(|c| c.agreement_score)
        .fold(f64::INFINITY, f64::min);
    if !min.is_finite() {
        return 0.0;
    }
    if min >= 0.8 {
        min
    } else {
        min * 0.5
    }
}

fn majority_score(contributions: &[Contribution]) -> f64 {
    if contributions.is_empty() {
        return 0.0;
    }
    contributions.iter().map(|c| c.agreement_score).sum::<f64>() / contributions.len() as f64
}

fn weighted_score(participants: &[Participant], contributions: &[Contribution]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for contribution in contributions {
        let weight = participants
            .iter()
            .enumerate()
            .find(|(index, p)| p.participant_id(*index) == contribution.participant_id)
            .and_then(|(_, p)| p.weight)
            .unwrap_or(1.0);
        weighted_sum += contribution.agreement_score * weight;
        total_weight += weight;
    }
    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    }
}

/// Convergence: the last round's score crossed the threshold, or three
/// or more rounds trend monotonically upward with a mean near the
/// threshold.
fn converged_now(rounds: &[DiscussionRound], options: &DiscussionOptions) -> bool {
    let last = match rounds.last() {
        Some(round) => round,
        None => return false,
    };
    if last.consensus_score >= options.convergence_threshold {
        return true;
    }
    if rounds.len() >= 3 {
        let scores: Vec<f64> = rounds.iter().map(|r| r.consensus_score).collect();
        let monotonic = scores.windows(2).all(|pair| pair[1] >= pair[0]);
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        if monotonic && mean >= 0.9 * options.convergence_threshold {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(id: &str, score: f64) -> Contribution {
        Contribution {
            participant_id: id.to_string(),
            role: "r".into(),
            content: String::new(),
            agreement_score: score,
            timestamp: Utc::now(),
        }
    }

    fn round(round: u32, score: f64) -> DiscussionRound {
        DiscussionRound {
            round,
            contributions: Vec::new(),
            synthesis: None,
            consensus_score: score,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_unanimous_scoring() {
        let high = vec![contribution("a", 0.9), contribution("b", 0.85)];
        assert!((unanimous_score(&high) - 0.85).abs() < 1e-9);

        // An outlier halves the minimum
        let outlier = vec![contribution("a", 0.9), contribution("b", 0.4)];
        assert!((unanimous_score(&outlier) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_majority_scoring() {
        let contributions = vec![contribution("a", 0.6), contribution("b", 1.0)];
        assert!((majority_score(&contributions) - 0.8).abs() < 1e-9);
        assert_eq!(majority_score(&[]), 0.0);
    }

    #[test]
    fn test_weighted_scoring() {
        let participants = vec![
            Participant {
                id: Some("a".into()),
                agent_id: "x".into(),
                role: "r".into(),
                perspective: None,
                weight: Some(3.0),
            },
            Participant {
                id: Some("b".into()),
                agent_id: "y".into(),
                role: "r".into(),
                perspective: None,
                weight: None, // defaults to 1.0
            },
        ];
        let contributions = vec![contribution("a", 1.0), contribution("b", 0.2)];
        // (1.0*3 + 0.2*1) / 4 = 0.8
        assert!((weighted_score(&participants, &contributions) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_convergence_on_threshold() {
        let options = DiscussionOptions::default();
        assert!(converged_now(&[round(1, 0.85)], &options));
        assert!(!converged_now(&[round(1, 0.5)], &options));
    }

    #[test]
    fn test_convergence_on_monotonic_trend() {
        let options = DiscussionOptions {
            convergence_threshold: 0.8,
            ..Default::default()
        };
        // Monotonic, mean 0.74 >= 0.72
        let rounds = vec![round(1, 0.7), round(2, 0.74), round(3, 0.78)];
        assert!(converged_now(&rounds, &options));

        // Non-monotonic
        let rounds = vec![round(1, 0.75), round(2, 0.7), round(3, 0.78)];
        assert!(!converged_now(&rounds, &options));
    }

    #[test]
    fn test_facilitator_requires_agent_id() {
        let options = DiscussionOptions {
            consensus_strategy: ConsensusStrategy::Facilitator,
            facilitator_agent_id: None,
            ..Default::default()
        };
        let participants = vec![Participant {
            id: None,
            agent_id: "a".into(),
            role: "r".into(),
            perspective: None,
            weight: None,
        }];
        let err = DiscussionService::validate(&participants, &options).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_participant_limit() {
        let options = DiscussionOptions::default();
        let participants: Vec<Participant> = (0..11)
            .map(|i| Participant {
                id: Some(format!("p{}", i)),
                agent_id: "a".into(),
                role: "r".into(),
                perspective: None,
                weight: None,
            })
            .collect();
        let err = DiscussionService::validate(&participants, &options).unwrap_err();
        assert_eq!(err.code(), "PARTICIPANT_LIMIT");
    }
}
