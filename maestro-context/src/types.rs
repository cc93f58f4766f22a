//! ABOUTME: Workflow context and snapshot record types
//! ABOUTME: Serde shapes persisted under workflow:context:* keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-execution hierarchical state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    #[serde(rename = "workflowId")]
    pub workflow_id: String,
    /// Arbitrary nested mapping; always a JSON object at the root
    pub data: Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "ttlSeconds")]
    pub ttl_seconds: u64,
}

/// Immutable copy of a context at a moment in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
    #[serde(rename = "workflowId")]
    pub workflow_id: String,
    pub label: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub data: Value,
}

/// Listing entry for a stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
    pub label: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
