//! ABOUTME: Canonical key layout for everything persisted in the shared store
//! ABOUTME: Single place to change a prefix without hunting call sites

/// Process state record, 24h TTL
pub fn process_state(id: &str) -> String {
    format!("process:{}", id)
}

/// Priority queue of pending processes (sorted set by composite score)
pub const PROCESS_QUEUE: &str = "process:queue";

/// Set of currently running process IDs
pub const PROCESS_ACTIVE: &str = "process:active";

/// Per-user rolling-window request counter
pub fn process_rate_limit(user_id: &str) -> String {
    format!("process:ratelimit:{}", user_id)
}

/// Moving-average process duration, for queue ETA
pub const PROCESS_AVG_DURATION: &str = "process:metrics:avg-duration";

/// Workflow execution state, 24h TTL
pub fn workflow_state(execution_id: &str) -> String {
    format!("workflow:state:{}", execution_id)
}

/// FIFO admission queue of waiting workflow executions
pub const WORKFLOW_QUEUE: &str = "workflow:queue";

/// Set of admitted (running) workflow execution IDs
pub const WORKFLOW_ACTIVE: &str = "workflow:active";

/// Per-user set of workflow execution IDs
pub fn workflow_user(user_id: &str) -> String {
    format!("workflow:user:{}", user_id)
}

/// Per-execution context blob
pub fn workflow_context(execution_id: &str) -> String {
    format!("workflow:context:{}", execution_id)
}

/// Immutable context snapshot
pub fn workflow_context_snapshot(execution_id: &str, snapshot_id: &str) -> String {
    format!("workflow:context:snapshot:{}:{}", execution_id, snapshot_id)
}

/// Prefix that scans every snapshot of one execution
pub fn workflow_context_snapshot_prefix(execution_id: &str) -> String {
    format!("workflow:context:snapshot:{}:", execution_id)
}

/// Agent registration record
pub fn agent_registry(agent_id: &str) -> String {
    format!("agent:registry:{}", agent_id)
}

/// Set of every registered agent ID
pub const AGENT_REGISTRY_LIST: &str = "agent:registry:list";

/// Set of agent IDs per type
pub fn agent_registry_type(agent_type: &str) -> String {
    format!("agent:registry:type:{}", agent_type)
}

/// Set of agent IDs per capability
pub fn agent_registry_capability(capability: &str) -> String {
    format!("agent:registry:capability:{}", capability)
}

/// Prompt template record
pub fn prompt_template(template_id: &str) -> String {
    format!("prompt:template:{}", template_id)
}

/// Sorted set of version records for a template (score = version)
pub fn prompt_template_versions(template_id: &str) -> String {
    format!("prompt:template:versions:{}", template_id)
}

/// Bounded rolling metrics list for a feature
pub fn metrics(feature: &str, name: &str) -> String {
    format!("{}:metrics:{}", feature, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes_match_layout() {
        assert_eq!(process_state("p1"), "process:p1");
        assert_eq!(workflow_state("e1"), "workflow:state:e1");
        assert_eq!(workflow_user("u1"), "workflow:user:u1");
        assert_eq!(
            workflow_context_snapshot("e1", "123-pause"),
            "workflow:context:snapshot:e1:123-pause"
        );
        assert_eq!(agent_registry_type("llm"), "agent:registry:type:llm");
        assert_eq!(metrics("workflow", "durations"), "workflow:metrics:durations");
    }
}
