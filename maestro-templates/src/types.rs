//! ABOUTME: Prompt template records, variables, and query types
//! ABOUTME: Serde shapes persisted under prompt:template:* keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a template variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// One declared variable of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TemplateVariable {
    pub fn required(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        var_type: VariableType,
        default: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: false,
            default,
            description: None,
        }
    }
}

/// A stored prompt template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub version: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of one template version, kept in the versions sorted set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersionRecord {
    pub version: u32,
    pub content: String,
    pub variables: Vec<TemplateVariable>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted on create
#[derive(Debug, Clone, Default)]
pub struct TemplateSpec {
    /// Explicit ID; generated when absent
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub content: String,
    pub variables: Vec<TemplateVariable>,
    pub category: String,
    pub tags: Vec<String>,
}

/// Partial update; None fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub variables: Option<Vec<TemplateVariable>>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Query parameters for listing templates
#[derive(Debug, Clone, Default)]
pub struct TemplateQuery {
    /// Exact category match
    pub category: Option<String>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    /// Case-insensitive substring over name/description/tags
    pub search: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}
