//! ABOUTME: Core identifier and wire-envelope types
//! ABOUTME: Provides ExecutionId, ApiResponse, and response metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::MaestroError;

/// Unique identifier for an execution (workflow, orchestration, critique,
/// discussion, or managed process run).
///
/// Uses UUID v4 for random generation and UUID v5 for deterministic
/// generation from names, so retried calls and tests can reproduce IDs.
///
/// # Examples
///
/// ```
/// use maestro_core::ExecutionId;
///
/// let id1 = ExecutionId::new();
/// let id2 = ExecutionId::new();
/// assert_ne!(id1, id2);
///
/// let id3 = ExecutionId::from_name("nightly-report");
/// let id4 = ExecutionId::from_name("nightly-report");
/// assert_eq!(id3, id4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Generate a new random ExecutionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an ExecutionId from a name (deterministic)
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()))
    }

    /// Parse a UUID string back into an ExecutionId
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the inner UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata attached to every response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

impl ResponseMeta {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
        }
    }
}

/// Wire-visible error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&MaestroError> for ErrorBody {
    fn from(err: &MaestroError) -> Self {
        let details = match err {
            MaestroError::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// Request/response envelope carried on every external interface.
///
/// Transport framing is out of scope; services hand these to whatever
/// transport hosts them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub meta: ResponseMeta,
}

impl<T> ApiResponse<T> {
    /// Successful envelope wrapping `data`
    pub fn ok(data: T, request_id: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta::new(request_id),
        }
    }

    /// Failed envelope carrying the error's wire code and message
    pub fn err(error: &MaestroError, request_id: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody::from(error)),
            meta: ResponseMeta::new(request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_uniqueness() {
        let id1 = ExecutionId::new();
        let id2 = ExecutionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_execution_id_from_name_deterministic() {
        assert_eq!(
            ExecutionId::from_name("exec-a"),
            ExecutionId::from_name("exec-a")
        );
        assert_ne!(
            ExecutionId::from_name("exec-a"),
            ExecutionId::from_name("exec-b")
        );
    }

    #[test]
    fn test_envelope_ok() {
        let resp = ApiResponse::ok(serde_json::json!({"n": 1}), "req-1");
        assert!(resp.success);
        assert!(resp.error.is_none());
        assert_eq!(resp.meta.request_id, "req-1");
    }

    #[test]
    fn test_envelope_err_carries_code() {
        let err = MaestroError::validation_field("steps must be unique", "steps");
        let resp: ApiResponse<Value> = ApiResponse::err(&err, "req-2");
        assert!(!resp.success);
        let body = resp.error.unwrap();
        assert_eq!(body.code, "VALIDATION_ERROR");
        assert_eq!(body.details.unwrap()["field"], "steps");
    }

    #[test]
    fn test_envelope_serialization_shape() {
        let resp = ApiResponse::ok(42u32, "req-3");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json["meta"]["requestId"].is_string());
        assert!(json.get("error").is_none());
    }
}
