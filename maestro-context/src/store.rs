//! ABOUTME: ContextStore — path reads/writes, deep-merge, snapshots, TTL
//! ABOUTME: Read-modify-write per execution; size and depth caps enforced on write

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use maestro_core::{paths, MaestroError, Result};
use maestro_store::{keys, StoreBackend};

use crate::types::{ContextSnapshot, SnapshotInfo, WorkflowContext};

/// Context store configuration
#[derive(Debug, Clone)]
pub struct ContextStoreConfig {
    /// Deepest path accepted on writes (segments)
    pub max_depth: usize,
    /// Largest serialized context accepted
    pub max_size_bytes: usize,
    /// Most-recent snapshots retained per execution
    pub max_snapshots: usize,
    /// TTL applied when the caller does not give one
    pub default_ttl: Duration,
}

impl Default for ContextStoreConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_size_bytes: 256 * 1024,
            max_snapshots: 10,
            default_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-execution context store.
///
/// One execution has one writer at a time, so every mutation is a
/// read-modify-write against the shared store. Parallel steps racing on
/// the same path are last-writer-wins by contract.
pub struct ContextStore {
    store: Arc<dyn StoreBackend>,
    config: ContextStoreConfig,
}

impl ContextStore {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self::with_config(store, ContextStoreConfig::default())
    }

    pub fn with_config(store: Arc<dyn StoreBackend>, config: ContextStoreConfig) -> Self {
        Self { store, config }
    }

    fn check_size(&self, context: &WorkflowContext) -> Result<String> {
        let raw = serde_json::to_string(context)
            .map_err(|e| MaestroError::internal(format!("serialize context: {}", e)))?;
        if raw.len() > self.config.max_size_bytes {
            return Err(MaestroError::Configuration {
                message: format!(
                    "context for '{}' exceeds {} bytes",
                    context.workflow_id, self.config.max_size_bytes
                ),
            });
        }
        Ok(raw)
    }

    async fn persist(&self, context: &WorkflowContext) -> Result<()> {
        let raw = self.check_size(context)?;
        self.store
            .set(
                &keys::workflow_context(&context.workflow_id),
                raw,
                Some(Duration::from_secs(context.ttl_seconds)),
            )
            .await
    }

    /// Create (or replace) the context for an execution
    pub async fn create(
        &self,
        workflow_id: &str,
        data: Value,
        ttl: Option<Duration>,
    ) -> Result<WorkflowContext> {
        let data = match data {
            Value::Object(_) => data,
            Value::Null => Value::Object(Map::new()),
            _ => {
                return Err(MaestroError::validation(
                    "context data must be a JSON object",
                ))
            }
        };
        let now = Utc::now();
        let context = WorkflowContext {
            workflow_id: workflow_id.to_string(),
            data,
            created_at: now,
            updated_at: now,
            ttl_seconds: ttl.unwrap_or(self.config.default_ttl).as_secs(),
        };
        self.persist(&context).await?;
        Ok(context)
    }

    /// Fetch the full context record
    pub async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowContext>> {
        match self.store.get(&keys::workflow_context(workflow_id)).await? {
            Some(raw) => {
                let context = serde_json::from_str(&raw)
                    .map_err(|e| MaestroError::storage(format!("corrupt context: {}", e)))?;
                Ok(Some(context))
            }
            None => Ok(None),
        }
    }

    async fn get_required(&self, workflow_id: &str) -> Result<WorkflowContext> {
        self.get(workflow_id)
            .await?
            .ok_or_else(|| MaestroError::not_found("context", workflow_id))
    }

    /// Read the value at a dotted path
    pub async fn get_value(&self, workflow_id: &str, path: &str) -> Result<Option<Value>> {
        let context = self.get_required(workflow_id).await?;
        Ok(paths::get_path(&context.data, path).cloned())
    }

    /// Write a value at a dotted path
    pub async fn set_value(&self, workflow_id: &str, path: &str, value: Value) -> Result<()> {
        let segments = paths::parse_path(path)?;
        if segments.len() > self.config.max_depth {
            return Err(MaestroError::Configuration {
                message: format!(
                    "path '{}' exceeds maximum depth of {}",
                    path, self.config.max_depth
                ),
            });
        }
        let mut context = self.get_required(workflow_id).await?;
        paths::set_path(&mut context.data, path, value)?;
        context.updated_at = Utc::now();
        self.persist(&context).await
    }

    /// Merge a mapping into the context; deep recurses into nested maps,
    /// shallow replaces top-level keys
    pub async fn merge(&self, workflow_id: &str, data: Value, deep: bool) -> Result<()> {
        let incoming = match data {
            Value::Object(map) => map,
            _ => {
                return Err(MaestroError::validation(
                    "merge data must be a JSON object",
                ))
            }
        };
        let mut context = self.get_required(workflow_id).await?;
        {
            let target = context
                .data
                .as_object_mut()
                .ok_or_else(|| MaestroError::internal("context root is not an object"))?;
            for (key, value) in incoming {
                if deep {
                    deep_merge_entry(target, key, value);
                } else {
                    target.insert(key, value);
                }
            }
        }
        context.updated_at = Utc::now();
        self.persist(&context).await
    }

    /// Remove a context and all of its snapshots
    pub async fn clear(&self, workflow_id: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(&keys::workflow_context(workflow_id))
            .await?;
        let snapshot_keys = self
            .store
            .scan_prefix(&keys::workflow_context_snapshot_prefix(workflow_id))
            .await?;
        for key in snapshot_keys {
            self.store.delete(&key).await?;
        }
        debug!(workflow_id, removed, "context cleared");
        Ok(removed)
    }

    /// Take an immutable snapshot; returns its ID
    pub async fn snapshot(&self, workflow_id: &str, label: &str) -> Result<String> {
        let context = self.get_required(workflow_id).await?;
        let created_at = Utc::now();
        let snapshot_id = format!("{}-{}", created_at.timestamp_millis(), label);
        let snapshot = ContextSnapshot {
            snapshot_id: snapshot_id.clone(),
            workflow_id: workflow_id.to_string(),
            label: label.to_string(),
            created_at,
            data: context.data,
        };
        let raw = serde_json::to_string(&snapshot)
            .map_err(|e| MaestroError::internal(format!("serialize snapshot: {}", e)))?;
        self.store
            .set(
                &keys::workflow_context_snapshot(workflow_id, &snapshot_id),
                raw,
                Some(Duration::from_secs(context.ttl_seconds)),
            )
            .await?;
        self.prune_snapshots(workflow_id).await?;
        Ok(snapshot_id)
    }

    async fn prune_snapshots(&self, workflow_id: &str) -> Result<()> {
        let mut snapshots = self.list_snapshots(workflow_id).await?;
        if snapshots.len() <= self.config.max_snapshots {
            return Ok(());
        }
        // list_snapshots returns oldest first
        let excess = snapshots.len() - self.config.max_snapshots;
        for info in snapshots.drain(..excess) {
            self.store
                .delete(&keys::workflow_context_snapshot(
                    workflow_id,
                    &info.snapshot_id,
                ))
                .await?;
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_id: &str,
        snapshot_id: &str,
    ) -> Result<ContextSnapshot> {
        let key = keys::workflow_context_snapshot(workflow_id, snapshot_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| MaestroError::not_found("snapshot", snapshot_id))?;
        serde_json::from_str(&raw)
            .map_err(|e| MaestroError::storage(format!("corrupt snapshot: {}", e)))
    }

    /// Restore context data from a snapshot
    pub async fn restore(&self, workflow_id: &str, snapshot_id: &str) -> Result<()> {
        let snapshot = self.load_snapshot(workflow_id, snapshot_id).await?;
        let mut context = self.get_required(workflow_id).await?;
        context.data = snapshot.data;
        context.updated_at = Utc::now();
        self.persist(&context).await
    }

    /// Snapshots of an execution, oldest first
    pub async fn list_snapshots(&self, workflow_id: &str) -> Result<Vec<SnapshotInfo>> {
        let snapshot_keys = self
            .store
            .scan_prefix(&keys::workflow_context_snapshot_prefix(workflow_id))
            .await?;
        let mut infos = Vec::with_capacity(snapshot_keys.len());
        for key in snapshot_keys {
            let raw = match self.store.get(&key).await? {
                Some(raw) => raw,
                None => continue,
            };
            let snapshot: ContextSnapshot = serde_json::from_str(&raw)
                .map_err(|e| MaestroError::storage(format!("corrupt snapshot: {}", e)))?;
            infos.push(SnapshotInfo {
                snapshot_id: snapshot.snapshot_id,
                label: snapshot.label,
                created_at: snapshot.created_at,
            });
        }
        infos.sort_by_key(|info| info.created_at);
        Ok(infos)
    }

    /// Substitute `{{path}}` references in a template with context values.
    /// Missing paths become empty strings.
    pub async fn resolve_variables(&self, workflow_id: &str, template: &str) -> Result<String> {
        let context = self.get_required(workflow_id).await?;
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        loop {
            let open = match rest.find("{{") {
                Some(pos) => pos,
                None => {
                    output.push_str(rest);
                    break;
                }
            };
            output.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            match after_open.find("}}") {
                Some(close) => {
                    let reference = after_open[..close].trim();
                    if let Some(value) = paths::get_path(&context.data, reference) {
                        output.push_str(&render_value(value));
                    }
                    rest = &after_open[close + 2..];
                }
                None => {
                    // Unterminated reference: emit verbatim
                    output.push_str("{{");
                    output.push_str(after_open);
                    break;
                }
            }
        }
        Ok(output)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn deep_merge_entry(target: &mut Map<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(incoming) => match target.get_mut(&key) {
            Some(Value::Object(existing)) => {
                for (nested_key, nested_value) in incoming {
                    deep_merge_entry(existing, nested_key, nested_value);
                }
            }
            _ => {
                target.insert(key, Value::Object(incoming));
            }
        },
        other => {
            target.insert(key, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_store::MemoryBackend;
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_create_and_path_roundtrip() {
        let contexts = store();
        contexts.create("e1", json!({"a": 1}), None).await.unwrap();
        contexts
            .set_value("e1", "b.c[1]", json!("deep"))
            .await
            .unwrap();
        assert_eq!(
            contexts.get_value("e1", "b.c[1]").await.unwrap(),
            Some(json!("deep"))
        );
        assert_eq!(contexts.get_value("e1", "a").await.unwrap(), Some(json!(1)));
        assert_eq!(contexts.get_value("e1", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_depth_cap_is_configuration_error() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let contexts = ContextStore::with_config(
            backend,
            ContextStoreConfig {
                max_depth: 3,
                ..Default::default()
            },
        );
        contexts.create("e1", json!({}), None).await.unwrap();
        let err = contexts
            .set_value("e1", "a.b.c.d", json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_size_cap_is_configuration_error() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let contexts = ContextStore::with_config(
            backend,
            ContextStoreConfig {
                max_size_bytes: 256,
                ..Default::default()
            },
        );
        contexts.create("e1", json!({}), None).await.unwrap();
        let big = "x".repeat(512);
        let err = contexts
            .set_value("e1", "blob", json!(big))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_deep_merge_recurses_and_replaces() {
        let contexts = store();
        contexts
            .create("e1", json!({"cfg": {"a": 1, "keep": true}, "arr": [1, 2]}), None)
            .await
            .unwrap();
        contexts
            .merge("e1", json!({"cfg": {"a": 2}, "arr": [9]}), true)
            .await
            .unwrap();
        let context = contexts.get("e1").await.unwrap().unwrap();
        assert_eq!(context.data["cfg"]["a"], 2);
        assert_eq!(context.data["cfg"]["keep"], true);
        // Arrays are replaced, not merged
        assert_eq!(context.data["arr"], json!([9]));
    }

    #[tokio::test]
    async fn test_deep_merge_idempotent() {
        let contexts = store();
        contexts.create("e1", json!({"a": {"b": 1}}), None).await.unwrap();
        let patch = json!({"a": {"b": 2, "c": 3}});
        contexts.merge("e1", patch.clone(), true).await.unwrap();
        let once = contexts.get("e1").await.unwrap().unwrap().data;
        contexts.merge("e1", patch, true).await.unwrap();
        let twice = contexts.get("e1").await.unwrap().unwrap().data;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_shallow_merge_replaces_nested() {
        let contexts = store();
        contexts
            .create("e1", json!({"cfg": {"a": 1, "keep": true}}), None)
            .await
            .unwrap();
        contexts
            .merge("e1", json!({"cfg": {"a": 2}}), false)
            .await
            .unwrap();
        let context = contexts.get("e1").await.unwrap().unwrap();
        assert_eq!(context.data["cfg"], json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let contexts = store();
        contexts.create("e1", json!({"v": 1}), None).await.unwrap();
        let snapshot_id = contexts.snapshot("e1", "before").await.unwrap();
        contexts.set_value("e1", "v", json!(2)).await.unwrap();
        assert_eq!(contexts.get_value("e1", "v").await.unwrap(), Some(json!(2)));

        contexts.restore("e1", &snapshot_id).await.unwrap();
        assert_eq!(contexts.get_value("e1", "v").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_snapshot_pruning_keeps_most_recent() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let contexts = ContextStore::with_config(
            backend,
            ContextStoreConfig {
                max_snapshots: 2,
                ..Default::default()
            },
        );
        contexts.create("e1", json!({}), None).await.unwrap();
        for i in 0..4 {
            contexts.snapshot("e1", &format!("s{}", i)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let snapshots = contexts.list_snapshots("e1").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].label, "s2");
        assert_eq!(snapshots[1].label, "s3");
    }

    #[tokio::test]
    async fn test_clear_removes_context_and_snapshots() {
        let contexts = store();
        contexts.create("e1", json!({"v": 1}), None).await.unwrap();
        contexts.snapshot("e1", "s").await.unwrap();
        assert!(contexts.clear("e1").await.unwrap());
        assert!(contexts.get("e1").await.unwrap().is_none());
        assert!(contexts.list_snapshots("e1").await.unwrap().is_empty());
        assert!(!contexts.clear("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_variables() {
        let contexts = store();
        contexts
            .create("e1", json!({"user": {"name": "Ada"}, "n": 3}), None)
            .await
            .unwrap();
        let resolved = contexts
            .resolve_variables("e1", "Hi {{user.name}}, {{n}} tasks, {{missing}} here")
            .await
            .unwrap();
        assert_eq!(resolved, "Hi Ada, 3 tasks,  here");
    }
}
