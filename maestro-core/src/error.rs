//! ABOUTME: Error types and handling for maestro
//! ABOUTME: Provides the MaestroError enum, wire codes, and Result type alias

use thiserror::Error;

/// Comprehensive error enum for all maestro operations
#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Permission denied: {message}")]
    Permission { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("Transient failure: {message}")]
    Transient { message: String },

    #[error("Capacity exceeded: {message}")]
    Capacity { message: String },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Agent unavailable: {id}")]
    AgentUnavailable { id: String },

    #[error("Participant limit: {message}")]
    ParticipantLimit { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MaestroError {
    /// Shorthand for a validation error without a field
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Shorthand for a validation error attached to a named field
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Shorthand for a not-found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Shorthand for a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire error code carried in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Permission { .. } => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Transient { .. } => "TRANSIENT_ERROR",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::AgentUnavailable { .. } => "AGENT_UNAVAILABLE",
            Self::ParticipantLimit { .. } => "PARTICIPANT_LIMIT",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether a local bounded-backoff retry is appropriate
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, MaestroError>;
