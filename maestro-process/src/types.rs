//! ABOUTME: Managed process configuration, status, and state records
//! ABOUTME: Serde shapes persisted under process:* keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle status of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ProcessStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed
                | ProcessStatus::Failed
                | ProcessStatus::Timeout
                | ProcessStatus::Cancelled
        )
    }
}

/// Spawn contract for one managed process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Stable ID; generated when absent. Reused across retries so
    /// streaming and status stay attached to one identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "captureOutput", default = "default_capture")]
    pub capture_output: bool,
    #[serde(
        rename = "maxOutputSize",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_output_size: Option<usize>,
    #[serde(
        rename = "stdinContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stdin_content: Option<String>,
}

fn default_capture() -> bool {
    true
}

impl ProcessConfig {
    pub fn new(user_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: None,
            user_id: user_id.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout_ms: None,
            capture_output: true,
            max_output_size: None,
            stdin_content: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_stdin(mut self, content: impl Into<String>) -> Self {
        self.stdin_content = Some(content.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Persisted state of one managed process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(rename = "processId")]
    pub process_id: String,
    pub config: ProcessConfig,
    pub status: ProcessStatus,
    /// Queue priority; higher dequeues first
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "completedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "queuePosition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_position: Option<u64>,
    #[serde(
        rename = "estimatedWaitSeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_wait_seconds: Option<u64>,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Timeout.is_terminal());
        assert!(ProcessStatus::Cancelled.is_terminal());
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Queued.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
    }

    #[test]
    fn test_config_serialization_defaults() {
        let json = serde_json::json!({
            "userId": "u1",
            "command": "echo"
        });
        let config: ProcessConfig = serde_json::from_value(json).unwrap();
        assert!(config.capture_output);
        assert!(config.args.is_empty());
        assert!(config.timeout().is_none());
    }
}
