//! ABOUTME: Built-in LLM and synthesis agents backed by external commands
//! ABOUTME: Prompts go over stdin through the process manager; output comes back as text

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use maestro_core::{
    AgentExecutionInput, AgentExecutionOutput, AgentExecutor, MaestroError, Result,
};
use maestro_process::{ProcessConfig, ProcessManager, ProcessStatus};

use crate::registry::AgentRegistry;
use crate::types::AgentType;

/// Stable IDs of the two built-in agents
pub const BUILTIN_LLM_ID: &str = "builtin-llm";
pub const BUILTIN_SYNTH_ID: &str = "builtin-synth";

/// Commands the built-in agents run
#[derive(Debug, Clone)]
pub struct BuiltinAgentsConfig {
    pub llm_command: String,
    pub llm_args: Vec<String>,
    pub synth_command: String,
    pub synth_args: Vec<String>,
    /// Timeout applied when the input carries none
    pub default_timeout: Duration,
}

impl Default for BuiltinAgentsConfig {
    fn default() -> Self {
        Self {
            llm_command: "claude".to_string(),
            llm_args: vec!["-p".to_string()],
            synth_command: "espeak-ng".to_string(),
            synth_args: vec!["--stdin".to_string()],
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Agent executor that pipes the prompt into an external command
pub struct CliAgentExecutor {
    manager: Arc<ProcessManager>,
    command: String,
    args: Vec<String>,
    capabilities: Vec<String>,
    default_timeout: Duration,
}

impl CliAgentExecutor {
    pub fn new(
        manager: Arc<ProcessManager>,
        command: impl Into<String>,
        args: Vec<String>,
        capabilities: Vec<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            command: command.into(),
            args,
            capabilities,
            default_timeout,
        }
    }

    fn command_on_path(&self) -> bool {
        let command = Path::new(&self.command);
        if command.is_absolute() {
            return command.exists();
        }
        std::env::var_os("PATH")
            .map(|path| {
                std::env::split_paths(&path).any(|dir| dir.join(&self.command).is_file())
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl AgentExecutor for CliAgentExecutor {
    async fn execute(&self, input: AgentExecutionInput) -> Result<AgentExecutionOutput> {
        let timeout = input.timeout().unwrap_or(self.default_timeout);
        let config = ProcessConfig::new(&input.context.user_id, &self.command)
            .with_args(self.args.clone())
            .with_stdin(input.prompt)
            .with_timeout(timeout);

        let state = self.manager.run_with_retry(config, 0).await?;
        let duration_ms = match (state.started_at, state.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        let output = match state.status {
            ProcessStatus::Completed => {
                AgentExecutionOutput::success(json!(state.stdout.trim_end()), duration_ms)
            }
            _ => AgentExecutionOutput::failure(
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("process ended with status {:?}", state.status)),
                duration_ms,
            ),
        };
        Ok(output
            .with_metadata("processId", json!(state.process_id))
            .with_metadata("exitCode", json!(state.exit_code))
            .with_metadata("retryCount", json!(state.retry_count)))
    }

    async fn probe(&self) -> Result<()> {
        if self.command_on_path() {
            Ok(())
        } else {
            Err(MaestroError::AgentUnavailable {
                id: format!("command '{}' not found on PATH", self.command),
            })
        }
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }
}

/// Register the built-in LLM and synth agents. Both live for the life of
/// the process and cannot be unregistered.
pub async fn register_builtin_agents(
    registry: &AgentRegistry,
    manager: Arc<ProcessManager>,
    config: &BuiltinAgentsConfig,
) -> Result<()> {
    let llm = CliAgentExecutor::new(
        manager.clone(),
        config.llm_command.clone(),
        config.llm_args.clone(),
        vec!["text-generation".into(), "reasoning".into()],
        config.default_timeout,
    );
    let llm_capabilities = llm.capabilities();
    registry
        .register_builtin(
            AgentType::Llm,
            format!("{} (built-in)", config.llm_command),
            llm_capabilities,
            Arc::new(llm),
            BUILTIN_LLM_ID.to_string(),
        )
        .await?;

    let synth = CliAgentExecutor::new(
        manager,
        config.synth_command.clone(),
        config.synth_args.clone(),
        vec!["speech-synthesis".into(), "audio".into()],
        config.default_timeout,
    );
    let synth_capabilities = synth.capabilities();
    registry
        .register_builtin(
            AgentType::Synth,
            format!("{} (built-in)", config.synth_command),
            synth_capabilities,
            Arc::new(synth),
            BUILTIN_SYNTH_ID.to_string(),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_events::EventBus;
    use maestro_store::MemoryBackend;

    #[tokio::test]
    async fn test_builtins_register_and_resist_unregister() {
        let store: Arc<dyn maestro_store::StoreBackend> = Arc::new(MemoryBackend::new());
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(ProcessManager::new(store.clone(), bus));
        let registry = AgentRegistry::new(store);

        register_builtin_agents(&registry, manager, &BuiltinAgentsConfig::default())
            .await
            .unwrap();

        assert!(registry.resolve(BUILTIN_LLM_ID).is_some());
        assert!(registry.resolve(BUILTIN_SYNTH_ID).is_some());
        assert_eq!(
            registry.resolve_default(AgentType::Llm).unwrap().id,
            BUILTIN_LLM_ID
        );
        assert!(registry.unregister(BUILTIN_LLM_ID).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_missing_command_fails() {
        let store: Arc<dyn maestro_store::StoreBackend> = Arc::new(MemoryBackend::new());
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(ProcessManager::new(store, bus));
        let executor = CliAgentExecutor::new(
            manager,
            "definitely-not-a-real-command-xyz",
            vec![],
            vec![],
            Duration::from_secs(5),
        );
        assert!(executor.probe().await.is_err());
    }
}
