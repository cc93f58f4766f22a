//! ABOUTME: Synchronous workflow definition validation
//! ABOUTME: Unique IDs, existing dependencies, acyclicity, caps, prompt exclusivity

use std::collections::{HashMap, HashSet};

use maestro_core::{expr, MaestroError, Result};

use crate::types::WorkflowDefinition;

/// Validate a definition against the engine's structural rules
pub fn validate_definition(definition: &WorkflowDefinition, max_steps: usize) -> Result<()> {
    if definition.steps.is_empty() {
        return Err(MaestroError::validation_field(
            "workflow has no steps",
            "steps",
        ));
    }
    if definition.steps.len() > max_steps {
        return Err(MaestroError::validation_field(
            format!("workflow exceeds {} steps", max_steps),
            "steps",
        ));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if step.id.is_empty() {
            return Err(MaestroError::validation_field(
                "step id cannot be empty",
                "steps",
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(MaestroError::validation_field(
                format!("duplicate step id '{}'", step.id),
                "steps",
            ));
        }
    }

    for step in &definition.steps {
        match (&step.prompt_template_id, &step.prompt) {
            (Some(_), Some(_)) => {
                return Err(MaestroError::validation_field(
                    format!(
                        "step '{}' sets both promptTemplateId and prompt",
                        step.id
                    ),
                    "steps",
                ))
            }
            (None, None) => {
                return Err(MaestroError::validation_field(
                    format!("step '{}' needs promptTemplateId or prompt", step.id),
                    "steps",
                ))
            }
            _ => {}
        }

        for dep in &step.dependencies {
            if dep == &step.id {
                return Err(MaestroError::validation_field(
                    format!("step '{}' depends on itself", step.id),
                    "steps",
                ));
            }
            if !seen.contains(dep.as_str()) {
                return Err(MaestroError::validation_field(
                    format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    "steps",
                ));
            }
        }

        if let Some(condition) = &step.condition {
            expr::parse(condition).map_err(|err| {
                MaestroError::validation_field(
                    format!("step '{}' condition invalid: {}", step.id, err),
                    "steps",
                )
            })?;
        }
    }

    detect_cycle(definition)?;
    Ok(())
}

/// Depth-first search with a recursion stack; any back-edge is a cycle
fn detect_cycle(definition: &WorkflowDefinition) -> Result<()> {
    let graph: HashMap<&str, Vec<&str>> = definition
        .steps
        .iter()
        .map(|step| {
            (
                step.id.as_str(),
                step.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if in_stack.contains(node) {
            return Err(MaestroError::validation_field(
                format!("dependency cycle through step '{}'", node),
                "steps",
            ));
        }
        if visited.contains(node) {
            return Ok(());
        }
        in_stack.insert(node);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                visit(dep, graph, visited, in_stack)?;
            }
        }
        in_stack.remove(node);
        visited.insert(node);
        Ok(())
    }

    for step in &definition.steps {
        visit(&step.id, &graph, &mut visited, &mut in_stack)?;
    }
    Ok(())
}

/// Topological order of step IDs (dependencies first). Assumes the
/// definition already validated acyclic.
pub fn topological_order(definition: &WorkflowDefinition) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &definition.steps {
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort();

    let mut order = Vec::with_capacity(definition.steps.len());
    while let Some(node) = ready.pop() {
        order.push(node.to_string());
        if let Some(children) = dependents.get(node) {
            for child in children {
                let degree = indegree.get_mut(child).expect("known step");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(child);
                    ready.sort();
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkflowDefinition, WorkflowStep};
    use maestro_agents::AgentType;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, id, AgentType::Custom)
            .with_prompt("p")
            .with_dependencies(deps.iter().copied())
    }

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("w1", "test");
        def.steps = steps;
        def
    }

    #[test]
    fn test_valid_diamond() {
        let def = definition(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        assert!(validate_definition(&def, 100).is_ok());
        let order = topological_order(&def);
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let def = definition(vec![step("a", &[]), step("a", &[])]);
        assert!(validate_definition(&def, 100).is_err());
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let def = definition(vec![step("a", &["ghost"])]);
        assert!(validate_definition(&def, 100).is_err());
    }

    #[test]
    fn test_rejects_cycle() {
        let def = definition(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = validate_definition(&def, 100).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_self_dependency() {
        let def = definition(vec![step("a", &["a"])]);
        assert!(validate_definition(&def, 100).is_err());
    }

    #[test]
    fn test_rejects_prompt_conflicts() {
        let mut both = step("a", &[]);
        both.prompt_template_id = Some("tpl".into());
        assert!(validate_definition(&definition(vec![both]), 100).is_err());

        let mut neither = step("a", &[]);
        neither.prompt = None;
        assert!(validate_definition(&definition(vec![neither]), 100).is_err());
    }

    #[test]
    fn test_rejects_step_cap_and_bad_condition() {
        let steps: Vec<WorkflowStep> = (0..5).map(|i| step(&format!("s{}", i), &[])).collect();
        assert!(validate_definition(&definition(steps), 4).is_err());

        let mut bad = step("a", &[]);
        bad.condition = Some("foo.bar == 1".into());
        assert!(validate_definition(&definition(vec![bad]), 100).is_err());
    }
}
