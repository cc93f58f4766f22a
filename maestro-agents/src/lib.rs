//! ABOUTME: Agent registry for maestro
//! ABOUTME: Executor registration, status tracking, health probes, built-in agents

pub mod builtin;
pub mod registry;
pub mod types;

pub use builtin::{
    register_builtin_agents, BuiltinAgentsConfig, CliAgentExecutor, BUILTIN_LLM_ID,
    BUILTIN_SYNTH_ID,
};
pub use registry::{AgentRegistry, AgentRegistryConfig};
pub use types::{AgentRecord, AgentStatus, AgentType};
