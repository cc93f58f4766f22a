//! ABOUTME: TemplateStore — CRUD, versioning, search, and rendering
//! ABOUTME: Write-through cache over the shared store, built-ins installed at startup

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use maestro_core::{MaestroError, Result};
use maestro_store::{keys, StoreBackend};

use crate::builtin::builtin_templates;
use crate::interpolate;
use crate::types::{
    PromptTemplate, TemplateQuery, TemplateSpec, TemplateUpdate, TemplateVersionRecord,
};

const VERSIONS_KEY_PREFIX: &str = "prompt:template:versions:";

/// Template store configuration
#[derive(Debug, Clone)]
pub struct TemplateStoreConfig {
    /// Version records retained per template
    pub max_versions: usize,
    /// Total templates accepted
    pub max_templates: usize,
}

impl Default for TemplateStoreConfig {
    fn default() -> Self {
        Self {
            max_versions: 10,
            max_templates: 1000,
        }
    }
}

/// Prompt template store.
///
/// Templates live in the shared store under `prompt:template:<id>` with a
/// sorted set of version records beside them; a process-local cache makes
/// reads cheap. Built-in templates are installed into the cache at
/// startup and persisted on first start against a fresh store, so user
/// templates can override them by ID.
pub struct TemplateStore {
    store: Arc<dyn StoreBackend>,
    cache: DashMap<String, PromptTemplate>,
    config: TemplateStoreConfig,
}

impl TemplateStore {
    pub async fn new(store: Arc<dyn StoreBackend>) -> Result<Self> {
        Self::with_config(store, TemplateStoreConfig::default()).await
    }

    pub async fn with_config(
        store: Arc<dyn StoreBackend>,
        config: TemplateStoreConfig,
    ) -> Result<Self> {
        let this = Self {
            store,
            cache: DashMap::new(),
            config,
        };
        this.install_builtins().await?;
        Ok(this)
    }

    async fn install_builtins(&self) -> Result<()> {
        for template in builtin_templates() {
            let key = keys::prompt_template(&template.id);
            match self.store.get(&key).await? {
                Some(raw) => {
                    // A persisted template (possibly a user override) wins.
                    let persisted: PromptTemplate = serde_json::from_str(&raw)
                        .map_err(|e| MaestroError::storage(format!("corrupt template: {}", e)))?;
                    self.cache.insert(persisted.id.clone(), persisted);
                }
                None => {
                    self.persist(&template).await?;
                    self.append_version(&template).await?;
                    self.cache.insert(template.id.clone(), template);
                }
            }
        }
        info!("installed built-in prompt templates");
        Ok(())
    }

    async fn persist(&self, template: &PromptTemplate) -> Result<()> {
        let raw = serde_json::to_string(template)
            .map_err(|e| MaestroError::internal(format!("serialize template: {}", e)))?;
        self.store
            .set(&keys::prompt_template(&template.id), raw, None)
            .await
    }

    async fn append_version(&self, template: &PromptTemplate) -> Result<()> {
        let record = TemplateVersionRecord {
            version: template.version,
            content: template.content.clone(),
            variables: template.variables.clone(),
            updated_at: template.updated_at,
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| MaestroError::internal(format!("serialize version: {}", e)))?;
        let key = keys::prompt_template_versions(&template.id);
        self.store
            .zset_add(&key, raw, f64::from(template.version))
            .await?;
        while self.store.zset_card(&key).await? > self.config.max_versions as u64 {
            self.store.zset_pop_min(&key).await?;
        }
        Ok(())
    }

    /// Create a new template; fails when the ID is already taken
    pub async fn create(&self, spec: TemplateSpec) -> Result<PromptTemplate> {
        interpolate::validate(&spec.content, &spec.variables)?;
        if spec.name.is_empty() {
            return Err(MaestroError::validation_field(
                "template name cannot be empty",
                "name",
            ));
        }

        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.get(&id).await?.is_some() {
            return Err(MaestroError::validation_field(
                format!("template '{}' already exists", id),
                "id",
            ));
        }

        let count = self.list(&TemplateQuery::default()).await?.len();
        if count >= self.config.max_templates {
            return Err(MaestroError::Capacity {
                message: format!("template limit of {} reached", self.config.max_templates),
            });
        }

        let now = Utc::now();
        let template = PromptTemplate {
            id: id.clone(),
            name: spec.name,
            description: spec.description,
            content: spec.content,
            variables: spec.variables,
            category: spec.category,
            tags: spec.tags,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.persist(&template).await?;
        self.append_version(&template).await?;
        self.cache.insert(id, template.clone());
        debug!(template_id = %template.id, "template created");
        Ok(template)
    }

    /// Apply a partial update; content or variable changes bump the version
    pub async fn update(&self, id: &str, update: TemplateUpdate) -> Result<PromptTemplate> {
        let mut template = self
            .get(id)
            .await?
            .ok_or_else(|| MaestroError::not_found("template", id))?;

        let content_changed = update
            .content
            .as_ref()
            .map(|c| *c != template.content)
            .unwrap_or(false);
        let variables_changed = update
            .variables
            .as_ref()
            .map(|v| {
                serde_json::to_string(v).ok() != serde_json::to_string(&template.variables).ok()
            })
            .unwrap_or(false);

        if let Some(name) = update.name {
            template.name = name;
        }
        if let Some(description) = update.description {
            template.description = description;
        }
        if let Some(content) = update.content {
            template.content = content;
        }
        if let Some(variables) = update.variables {
            template.variables = variables;
        }
        if let Some(category) = update.category {
            template.category = category;
        }
        if let Some(tags) = update.tags {
            template.tags = tags;
        }

        interpolate::validate(&template.content, &template.variables)?;
        template.updated_at = Utc::now();
        if content_changed || variables_changed {
            template.version += 1;
            self.append_version(&template).await?;
        }

        self.persist(&template).await?;
        self.cache.insert(template.id.clone(), template.clone());
        Ok(template)
    }

    /// Delete a template and its version history
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.cache.remove(id);
        let removed = self.store.delete(&keys::prompt_template(id)).await?;
        self.store
            .delete(&keys::prompt_template_versions(id))
            .await?;
        Ok(removed)
    }

    /// Get a template by ID
    pub async fn get(&self, id: &str) -> Result<Option<PromptTemplate>> {
        if let Some(template) = self.cache.get(id) {
            return Ok(Some(template.clone()));
        }
        match self.store.get(&keys::prompt_template(id)).await? {
            Some(raw) => {
                let template: PromptTemplate = serde_json::from_str(&raw)
                    .map_err(|e| MaestroError::storage(format!("corrupt template: {}", e)))?;
                self.cache.insert(template.id.clone(), template.clone());
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    /// List templates matching a query, sorted by name
    pub async fn list(&self, query: &TemplateQuery) -> Result<Vec<PromptTemplate>> {
        let keys = self.store.scan_prefix("prompt:template:").await?;
        let mut templates = Vec::new();
        for key in keys {
            if key.starts_with(VERSIONS_KEY_PREFIX) {
                continue;
            }
            let id = key.trim_start_matches("prompt:template:");
            if let Some(template) = self.get(id).await? {
                templates.push(template);
            }
        }

        templates.retain(|template| {
            if let Some(category) = &query.category {
                if &template.category != category {
                    return false;
                }
            }
            if !query.tags.is_empty()
                && !query.tags.iter().all(|tag| template.tags.contains(tag))
            {
                return false;
            }
            if let Some(search) = &query.search {
                let needle = search.to_lowercase();
                let haystack = format!(
                    "{} {} {}",
                    template.name.to_lowercase(),
                    template.description.to_lowercase(),
                    template.tags.join(" ").to_lowercase()
                );
                if !haystack.contains(&needle) {
                    return false;
                }
            }
            true
        });

        templates.sort_by(|a, b| a.name.cmp(&b.name));

        let offset = query.offset.unwrap_or(0);
        let mut page: Vec<PromptTemplate> = templates.into_iter().skip(offset).collect();
        if let Some(limit) = query.limit {
            page.truncate(limit);
        }
        Ok(page)
    }

    /// Version history, oldest first
    pub async fn versions(&self, id: &str) -> Result<Vec<TemplateVersionRecord>> {
        let raw = self
            .store
            .zset_range(&keys::prompt_template_versions(id), 0, -1)
            .await?;
        raw.into_iter()
            .map(|(record, _)| {
                serde_json::from_str(&record)
                    .map_err(|e| MaestroError::storage(format!("corrupt version record: {}", e)))
            })
            .collect()
    }

    /// Render a template with provided values
    pub async fn render(&self, id: &str, provided: &Map<String, Value>) -> Result<String> {
        let template = self
            .get(id)
            .await?
            .ok_or_else(|| MaestroError::not_found("template", id))?;
        interpolate::interpolate(&template.content, provided, &template.variables)
    }
}
