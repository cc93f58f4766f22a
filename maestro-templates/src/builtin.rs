//! ABOUTME: Built-in templates installed at startup
//! ABOUTME: Critique evaluation/improvement and discussion participant/facilitator

use chrono::Utc;
use serde_json::json;

use crate::types::{PromptTemplate, TemplateVariable, VariableType};

pub const CRITIQUE_EVALUATION: &str = "critique-evaluation";
pub const CRITIQUE_IMPROVEMENT: &str = "critique-improvement";
pub const DISCUSSION_PARTICIPANT: &str = "discussion-participant";
pub const DISCUSSION_FACILITATOR: &str = "discussion-facilitator";

fn template(
    id: &str,
    name: &str,
    description: &str,
    content: &str,
    variables: Vec<TemplateVariable>,
    tags: &[&str],
) -> PromptTemplate {
    let now = Utc::now();
    PromptTemplate {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        content: content.to_string(),
        variables,
        category: "builtin".to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

/// The four templates every deployment starts with
pub fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        template(
            CRITIQUE_EVALUATION,
            "Critique evaluation",
            "Scores an output against weighted quality criteria",
            "You are a strict quality evaluator. Evaluate the output below \
against each criterion and score it from 0.0 to 1.0.\n\n\
Original task:\n{{task}}\n\n\
Output to evaluate:\n{{output}}\n\n\
Criteria:\n{{criteria}}\n\n\
Respond with a single JSON object of the form:\n\
{\"criteriaScores\": {\"<criterion-name>\": 0.0}, \"feedback\": \"...\", \
\"suggestions\": [\"...\"]}\n\
Do not add any commentary outside the JSON object.",
            vec![
                TemplateVariable::optional("task", VariableType::String, Some(json!(""))),
                TemplateVariable::required("output", VariableType::String),
                TemplateVariable::required("criteria", VariableType::String),
            ],
            &["critique", "evaluation"],
        ),
        template(
            CRITIQUE_IMPROVEMENT,
            "Critique improvement",
            "Asks the agent to improve its previous output using critique feedback",
            "Improve the previous output using the critique below. Keep what \
scored well and fix what did not.\n\n\
Original task:\n{{task}}\n\n\
Previous output:\n{{output}}\n\n\
Critique feedback:\n{{feedback}}\n\n\
Suggestions:\n{{suggestions}}\n\n\
Return only the improved output.",
            vec![
                TemplateVariable::optional("task", VariableType::String, Some(json!(""))),
                TemplateVariable::required("output", VariableType::String),
                TemplateVariable::required("feedback", VariableType::String),
                TemplateVariable::optional("suggestions", VariableType::String, Some(json!(""))),
            ],
            &["critique", "improvement"],
        ),
        template(
            DISCUSSION_PARTICIPANT,
            "Discussion participant",
            "One participant's contribution to a multi-agent discussion round",
            "You are participating in a structured discussion.\n\n\
Topic: {{topic}}\n\
Your role: {{role}}\n\
Your perspective: {{perspective}}\n\
Round: {{round}}\n\n\
Synthesis of the previous round:\n{{previous_synthesis}}\n\n\
Contributions from the previous round:\n{{previous_contributions}}\n\n\
Give your contribution for this round from your role's point of view. \
Engage with the other participants' arguments where you disagree. End \
with a line of the form \"agreement: N/10\" indicating how strongly you \
agree with the emerging consensus.",
            vec![
                TemplateVariable::required("topic", VariableType::String),
                TemplateVariable::required("role", VariableType::String),
                TemplateVariable::optional("perspective", VariableType::String, Some(json!(""))),
                TemplateVariable::optional("round", VariableType::Number, Some(json!(1))),
                TemplateVariable::optional(
                    "previous_synthesis",
                    VariableType::String,
                    Some(json!("(first round)")),
                ),
                TemplateVariable::optional(
                    "previous_contributions",
                    VariableType::String,
                    Some(json!("(none)")),
                ),
            ],
            &["discussion", "participant"],
        ),
        template(
            DISCUSSION_FACILITATOR,
            "Discussion facilitator",
            "Synthesizes a discussion round and scores its consensus",
            "You are facilitating a structured discussion.\n\n\
Topic: {{topic}}\n\
Round: {{round}}\n\n\
Contributions this round:\n{{contributions}}\n\n\
Synthesize the round and judge how close the participants are to \
consensus. Respond with a single JSON object of the form:\n\
{\"synthesis\": \"...\", \"consensusScore\": 0.0, \"agreements\": [\"...\"], \
\"disagreements\": [\"...\"], \"nextSteps\": [\"...\"]}\n\
consensusScore is between 0.0 and 1.0.",
            vec![
                TemplateVariable::required("topic", VariableType::String),
                TemplateVariable::optional("round", VariableType::Number, Some(json!(1))),
                TemplateVariable::required("contributions", VariableType::String),
            ],
            &["discussion", "facilitator"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolate;

    #[test]
    fn test_builtins_are_valid() {
        let templates = builtin_templates();
        assert_eq!(templates.len(), 4);
        for template in &templates {
            interpolate::validate(&template.content, &template.variables)
                .unwrap_or_else(|e| panic!("builtin {} invalid: {}", template.id, e));
        }
    }

    #[test]
    fn test_builtin_ids() {
        let ids: Vec<String> = builtin_templates().into_iter().map(|t| t.id).collect();
        assert!(ids.contains(&CRITIQUE_EVALUATION.to_string()));
        assert!(ids.contains(&CRITIQUE_IMPROVEMENT.to_string()));
        assert!(ids.contains(&DISCUSSION_PARTICIPANT.to_string()));
        assert!(ids.contains(&DISCUSSION_FACILITATOR.to_string()));
    }
}
