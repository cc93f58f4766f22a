//! ABOUTME: Prompt template store for maestro
//! ABOUTME: Versioned CRUD, validation, interpolation, and built-in templates

pub mod builtin;
pub mod interpolate;
pub mod store;
pub mod types;

pub use store::{TemplateStore, TemplateStoreConfig};
pub use types::{
    PromptTemplate, TemplateQuery, TemplateSpec, TemplateUpdate, TemplateVariable,
    TemplateVersionRecord, VariableType,
};
