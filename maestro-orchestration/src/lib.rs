//! ABOUTME: Orchestration patterns for maestro
//! ABOUTME: Sequential, parallel, conditional, and map-reduce task compositions

pub mod service;
pub mod types;

pub use service::{OrchestrationConfig, OrchestrationService};
pub use types::{
    OrchestrationPattern, OrchestrationRequest, OrchestrationResult, OrchestrationStatus, Task,
    TaskResult,
};
