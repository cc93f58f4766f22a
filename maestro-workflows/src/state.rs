//! ABOUTME: Workflow and step execution state records
//! ABOUTME: Persisted under workflow:state:* with computed progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    /// Ready but waiting for parallelism capacity
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// State of one step within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    #[serde(rename = "stepId")]
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "completedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "durationMs", default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepState {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// State of a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "workflowId")]
    pub workflow_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: WorkflowStatus,
    pub steps: HashMap<String, StepState>,
    #[serde(rename = "currentSteps", default)]
    pub current_steps: Vec<String>,
    #[serde(
        rename = "queuePosition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_position: Option<u64>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "completedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0..100, integer floor of (done + 0.5 × running) / total
    pub progress: u8,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_id: impl Into<String>,
        step_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let steps = step_ids
            .into_iter()
            .map(|id| (id.clone(), StepState::pending(id)))
            .collect();
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            status: WorkflowStatus::Pending,
            steps,
            current_steps: Vec::new(),
            queue_position: None,
            started_at: None,
            completed_at: None,
            error: None,
            progress: 0,
            created_at: Utc::now(),
        }
    }

    /// Recompute progress and the currently running step list
    pub fn refresh_progress(&mut self) {
        let total = self.steps.len();
        if total == 0 {
            self.progress = 0;
            return;
        }
        let done = self
            .steps
            .values()
            .filter(|s| s.status.is_terminal())
            .count();
        let running = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .count();
        self.current_steps = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .map(|s| s.step_id.clone())
            .collect();
        self.current_steps.sort();
        self.progress =
            (((done as f64 + 0.5 * running as f64) / total as f64) * 100.0).floor() as u8;
    }

    /// Whether any step failed
    pub fn any_step_failed(&self) -> bool {
        self.steps
            .values()
            .any(|s| s.status == StepStatus::Failed)
    }

    /// Whether every step reached a terminal status
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(statuses: &[(&str, StepStatus)]) -> WorkflowState {
        let mut state = WorkflowState::new(
            "e1",
            "w1",
            "u1",
            statuses.iter().map(|(id, _)| id.to_string()),
        );
        for (id, status) in statuses {
            state.steps.get_mut(*id).unwrap().status = *status;
        }
        state.refresh_progress();
        state
    }

    #[test]
    fn test_progress_formula() {
        let state = state_with(&[
            ("a", StepStatus::Completed),
            ("b", StepStatus::Running),
            ("c", StepStatus::Pending),
            ("d", StepStatus::Pending),
        ]);
        // (1 + 0.5) / 4 = 37.5 -> 37
        assert_eq!(state.progress, 37);
        assert_eq!(state.current_steps, vec!["b"]);
    }

    #[test]
    fn test_progress_counts_skipped_and_failed_as_done() {
        let state = state_with(&[
            ("a", StepStatus::Failed),
            ("b", StepStatus::Skipped),
        ]);
        assert_eq!(state.progress, 100);
        assert!(state.any_step_failed());
        assert!(state.all_steps_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::Queued.is_terminal());
    }
}
