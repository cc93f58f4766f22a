//! ABOUTME: AgentRegistry — executor registration, resolution, and execution
//! ABOUTME: Tracks busy/idle/error status, error thresholds, and periodic health probes

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use maestro_core::{
    AgentExecutionInput, AgentExecutionOutput, AgentExecutor, MaestroError, Result,
};
use maestro_store::{keys, StoreBackend};

use crate::types::{AgentRecord, AgentStatus, AgentType};

/// Registry configuration
#[derive(Debug, Clone)]
pub struct AgentRegistryConfig {
    /// Consecutive probe/execution failures before status becomes Error
    pub error_threshold: u32,
    /// Hard timeout on a single health probe
    pub probe_timeout: Duration,
    /// Period of the background health loop
    pub health_interval: Duration,
}

impl Default for AgentRegistryConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            probe_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
        }
    }
}

struct RegisteredAgent {
    executor: Arc<dyn AgentExecutor>,
    record: RwLock<AgentRecord>,
    builtin: bool,
}

/// Flips an abandoned Busy agent back to Idle
struct BusyGuard {
    entry: Arc<RegisteredAgent>,
    armed: bool,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut record = self.entry.record.write();
            if record.status == AgentStatus::Busy {
                record.status = AgentStatus::Idle;
            }
        }
    }
}

/// Agent registry.
///
/// Holds every executor with its status record, maintains type and
/// capability indices in the shared store, and runs periodic health
/// probes that flip agents into (and out of) the Error status.
pub struct AgentRegistry {
    store: Arc<dyn StoreBackend>,
    config: AgentRegistryConfig,
    agents: DashMap<String, Arc<RegisteredAgent>>,
    defaults: DashMap<AgentType, String>,
    shutdown: CancellationToken,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self::with_config(store, AgentRegistryConfig::default())
    }

    pub fn with_config(store: Arc<dyn StoreBackend>, config: AgentRegistryConfig) -> Self {
        Self {
            store,
            config,
            agents: DashMap::new(),
            defaults: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an executor. Passing an existing `agent_id` makes the
    /// call idempotent: the registration is replaced in place.
    pub async fn register(
        &self,
        agent_type: AgentType,
        name: impl Into<String>,
        capabilities: Vec<String>,
        executor: Arc<dyn AgentExecutor>,
        agent_id: Option<String>,
    ) -> Result<AgentRecord> {
        self.register_inner(agent_type, name.into(), capabilities, executor, agent_id, false)
            .await
    }

    pub(crate) async fn register_builtin(
        &self,
        agent_type: AgentType,
        name: String,
        capabilities: Vec<String>,
        executor: Arc<dyn AgentExecutor>,
        agent_id: String,
    ) -> Result<AgentRecord> {
        self.register_inner(agent_type, name, capabilities, executor, Some(agent_id), true)
            .await
    }

    async fn register_inner(
        &self,
        agent_type: AgentType,
        name: String,
        capabilities: Vec<String>,
        executor: Arc<dyn AgentExecutor>,
        agent_id: Option<String>,
        builtin: bool,
    ) -> Result<AgentRecord> {
        let id = agent_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let replacing_builtin = self
            .agents
            .get(&id)
            .map(|existing| existing.builtin && !builtin)
            .unwrap_or(false);
        if replacing_builtin {
            return Err(MaestroError::validation(format!(
                "built-in agent '{}' cannot be replaced",
                id
            )));
        }

        let record = AgentRecord {
            id: id.clone(),
            agent_type,
            name,
            capabilities: capabilities.clone(),
            status: AgentStatus::Idle,
            error_count: 0,
            last_health_check: None,
            registered_at: self
                .agents
                .get(&id)
                .map(|existing| existing.record.read().registered_at)
                .unwrap_or_else(Utc::now),
        };

        self.persist(&record).await?;
        self.store
            .set_add(keys::AGENT_REGISTRY_LIST, id.clone())
            .await?;
        self.store
            .set_add(&keys::agent_registry_type(agent_type.as_str()), id.clone())
            .await?;
        for capability in &capabilities {
            self.store
                .set_add(&keys::agent_registry_capability(capability), id.clone())
                .await?;
        }

        self.agents.insert(
            id.clone(),
            Arc::new(RegisteredAgent {
                executor,
                record: RwLock::new(record.clone()),
                builtin,
            }),
        );
        self.defaults.entry(agent_type).or_insert_with(|| id.clone());

        debug!(agent_id = %id, agent_type = %agent_type, "agent registered");
        Ok(record)
    }

    /// Unregister an agent; built-in agents refuse
    pub async fn unregister(&self, id: &str) -> Result<bool> {
        let entry = match self.agents.get(id) {
            Some(entry) => entry.clone(),
            None => return Ok(false),
        };
        if entry.builtin {
            return Err(MaestroError::validation(format!(
                "built-in agent '{}' cannot be unregistered",
                id
            )));
        }

        let record = entry.record.read().clone();
        self.agents.remove(id);
        self.store.delete(&keys::agent_registry(id)).await?;
        self.store.set_remove(keys::AGENT_REGISTRY_LIST, id).await?;
        self.store
            .set_remove(&keys::agent_registry_type(record.agent_type.as_str()), id)
            .await?;
        for capability in &record.capabilities {
            self.store
                .set_remove(&keys::agent_registry_capability(capability), id)
                .await?;
        }

        // Re-point the default at any remaining agent of the type.
        let was_default = self
            .defaults
            .get(&record.agent_type)
            .map(|d| d.value() == id)
            .unwrap_or(false);
        if was_default {
            self.defaults.remove(&record.agent_type);
            if let Some(next) = self
                .agents
                .iter()
                .find(|a| a.value().record.read().agent_type == record.agent_type)
            {
                self.defaults
                    .insert(record.agent_type, next.key().clone());
            }
        }
        Ok(true)
    }

    /// Resolve an agent by ID
    pub fn resolve(&self, id: &str) -> Option<AgentRecord> {
        self.agents.get(id).map(|entry| entry.record.read().clone())
    }

    /// Resolve the default agent for a type
    pub fn resolve_default(&self, agent_type: AgentType) -> Option<AgentRecord> {
        let id = self.defaults.get(&agent_type)?.value().clone();
        self.resolve(&id)
    }

    /// All registered agents
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .iter()
            .map(|entry| entry.value().record.read().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Agents advertising every listed capability
    pub async fn find_by_capabilities(&self, capabilities: &[String]) -> Result<Vec<AgentRecord>> {
        if capabilities.is_empty() {
            return Ok(self.list());
        }
        let index_keys: Vec<String> = capabilities
            .iter()
            .map(|c| keys::agent_registry_capability(c))
            .collect();
        let ids = self.store.set_intersection(&index_keys).await?;
        Ok(ids.iter().filter_map(|id| self.resolve(id)).collect())
    }

    /// Execute an agent: status flips to Busy for the duration, Errors
    /// accumulate toward the threshold, and unavailable agents refuse.
    pub async fn execute(
        &self,
        id: &str,
        input: AgentExecutionInput,
    ) -> Result<AgentExecutionOutput> {
        let entry = self
            .agents
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| MaestroError::not_found("agent", id))?;

        {
            let record = entry.record.read();
            if !record.status.is_available() {
                return Err(MaestroError::AgentUnavailable { id: id.to_string() });
            }
        }

        self.set_status(&entry, AgentStatus::Busy).await;
        // Restores Idle if the caller abandons this future mid-call.
        let mut guard = BusyGuard {
            entry: entry.clone(),
            armed: true,
        };

        let timeout = input.timeout();
        let run = entry.executor.execute(input);
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => Err(MaestroError::Timeout {
                    message: format!("agent '{}' timed out after {}ms", id, timeout.as_millis()),
                }),
            },
            None => run.await,
        };
        guard.armed = false;

        match &result {
            Ok(output) if output.success => {
                self.note_success(&entry).await;
            }
            Ok(_) | Err(_) => {
                self.note_failure(&entry).await;
            }
        }
        result
    }

    async fn set_status(&self, entry: &Arc<RegisteredAgent>, status: AgentStatus) {
        let record = {
            let mut record = entry.record.write();
            record.status = status;
            record.clone()
        };
        if let Err(err) = self.persist(&record).await {
            warn!(agent_id = %record.id, error = %err, "failed to persist agent record");
        }
    }

    async fn note_success(&self, entry: &Arc<RegisteredAgent>) {
        let record = {
            let mut record = entry.record.write();
            record.status = AgentStatus::Idle;
            record.clone()
        };
        let _ = self.persist(&record).await;
    }

    async fn note_failure(&self, entry: &Arc<RegisteredAgent>) {
        let record = {
            let mut record = entry.record.write();
            record.error_count += 1;
            record.status = if record.error_count >= self.config.error_threshold {
                AgentStatus::Error
            } else {
                AgentStatus::Idle
            };
            record.clone()
        };
        if record.status == AgentStatus::Error {
            warn!(
                agent_id = %record.id,
                error_count = record.error_count,
                "agent crossed error threshold"
            );
        }
        let _ = self.persist(&record).await;
    }

    /// Probe every agent once. A healthy probe resets the error count
    /// and recovers agents out of the Error status.
    pub async fn health_check_all(&self) {
        let entries: Vec<Arc<RegisteredAgent>> =
            self.agents.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let id = entry.record.read().id.clone();
            let probe = entry.executor.probe();
            let healthy =
                match tokio::time::timeout(self.config.probe_timeout, probe).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        debug!(agent_id = %id, error = %err, "health probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(agent_id = %id, "health probe timed out");
                        false
                    }
                };

            let record = {
                let mut record = entry.record.write();
                record.last_health_check = Some(Utc::now());
                if healthy {
                    record.error_count = 0;
                    if record.status == AgentStatus::Error {
                        info!(agent_id = %id, "agent recovered");
                        record.status = AgentStatus::Idle;
                    }
                } else {
                    record.error_count += 1;
                    if record.error_count >= self.config.error_threshold {
                        record.status = AgentStatus::Error;
                    }
                }
                record.clone()
            };
            let _ = self.persist(&record).await;
        }
    }

    /// Spawn the periodic health loop
    pub fn start_health_loop(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.health_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = interval.tick() => registry.health_check_all().await,
                }
            }
        });
    }

    /// Stop the health loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn persist(&self, record: &AgentRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| MaestroError::internal(format!("serialize agent record: {}", e)))?;
        self.store.set(&keys::agent_registry(&record.id), raw, None).await
    }
}
