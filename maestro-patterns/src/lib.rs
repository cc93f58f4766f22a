//! ABOUTME: Collaboration patterns for maestro
//! ABOUTME: Iterative self-critique and multi-agent consensus discussions

pub mod critique;
pub mod discussion;
pub mod extract;

pub use critique::{
    Critique, CritiqueIteration, CritiqueOptions, CritiqueResult, QualityCriterion,
    SelfCritiqueService,
};
pub use discussion::{
    ConsensusStrategy, Contribution, DiscussionOptions, DiscussionResult, DiscussionRound,
    DiscussionService, Participant, MAX_PARTICIPANTS,
};
pub use extract::{extract_agreement_score, extract_first_json_object};
