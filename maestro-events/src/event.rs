//! ABOUTME: BusEvent envelope for engine-wide progress events
//! ABOUTME: Carries execution ID, typed name, payload, and a global sequence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Global sequence counter for event ordering
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Event envelope delivered to subscribers.
///
/// `event_type` is dotted (`workflow.step.completed`, `process.stdout`);
/// the final segment names the transition. `sequence` is monotonically
/// increasing per process, giving per-publisher FIFO order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Dotted event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Execution (or process) this event belongs to
    #[serde(rename = "executionId")]
    pub execution_id: String,
    /// Type-specific payload
    pub data: Value,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number for ordering
    pub sequence: u64,
}

impl BusEvent {
    /// Create a new event
    pub fn new(
        event_type: impl Into<String>,
        execution_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            execution_id: execution_id.into(),
            data,
            timestamp: Utc::now(),
            sequence: SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Whether this event closes its execution's stream.
    ///
    /// Terminal events are always `<feature>.<transition>`; step- and
    /// round-level events carry a deeper type and never close a stream.
    pub fn is_terminal(&self) -> bool {
        let mut parts = self.event_type.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(last), None) => matches!(
                last,
                "completed" | "failed" | "cancelled" | "exit" | "timeout" | "error"
            ),
            _ => false,
        }
    }

    /// Check the event type against a glob pattern (`workflow.*`, `*`)
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.event_type.starts_with(prefix)
        } else {
            self.event_type == pattern
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ordering() {
        let a = BusEvent::new("x", "e1", Value::Null);
        let b = BusEvent::new("x", "e1", Value::Null);
        assert!(a.sequence < b.sequence);
    }

    #[test]
    fn test_terminal_detection() {
        assert!(BusEvent::new("workflow.completed", "e", Value::Null).is_terminal());
        assert!(BusEvent::new("workflow.failed", "e", Value::Null).is_terminal());
        assert!(BusEvent::new("process.exit", "p", Value::Null).is_terminal());
        assert!(BusEvent::new("process.timeout", "p", Value::Null).is_terminal());
        assert!(!BusEvent::new("workflow.step.started", "e", Value::Null).is_terminal());
        assert!(!BusEvent::new("workflow.step.failed", "e", Value::Null).is_terminal());
        assert!(!BusEvent::new("workflow.step.completed", "e", Value::Null).is_terminal());
        assert!(!BusEvent::new("process.stdout", "p", Value::Null).is_terminal());
    }

    #[test]
    fn test_pattern_matching() {
        let event = BusEvent::new("workflow.step.completed", "e", Value::Null);
        assert!(event.matches_pattern("*"));
        assert!(event.matches_pattern("workflow.*"));
        assert!(event.matches_pattern("workflow.step.completed"));
        assert!(!event.matches_pattern("process.*"));
    }

    #[test]
    fn test_serialization_field_names() {
        let event = BusEvent::new("workflow.started", "exec-1", serde_json::json!({"n": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow.started");
        assert_eq!(json["executionId"], "exec-1");
    }
}
