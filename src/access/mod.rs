//! Ports to external collaborators: the event-model service, the data-model
//! query services and the permission service, plus a short-lived cache for
//! model resolution on the hot streaming path.

pub mod http;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::{DataSource, EventModel, EventQuery, SourceRecords};

/// How long resolved model lists stay fresh on the streaming path.
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Event-model service lookups.
#[async_trait]
pub trait EventModelAccess: Send + Sync {
    async fn get_event_model_by_id(&self, id: &str) -> Result<Option<EventModel>, AccessError>;

    /// Models whose data source references the given source id.
    async fn get_event_models_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Vec<EventModel>, AccessError>;
}

/// Source-record retrieval for a model's data source. One implementation
/// per backing service; the model's `data_source_type` selects it.
#[async_trait]
pub trait DataModelQuery: Send + Sync {
    async fn fetch_source_records(
        &self,
        model: &EventModel,
        query: &EventQuery,
    ) -> Result<SourceRecords, AccessError>;
}

/// Authorization check before running a query on someone's behalf.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn check_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, AccessError>;
}

struct CacheEntry {
    models: Vec<EventModel>,
    fetched_at: Instant,
}

/// TTL cache over model resolution, keyed by source id. Dependency lookups
/// use a `_depend`-suffixed key so a model id used both as a data source
/// and as a dependency root does not collide.
pub struct ModelCache {
    access: Arc<dyn EventModelAccess>,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(access: Arc<dyn EventModelAccess>) -> Self {
        Self::with_ttl(access, MODEL_CACHE_TTL)
    }

    pub fn with_ttl(access: Arc<dyn EventModelAccess>, ttl: Duration) -> Self {
        Self { access, entries: DashMap::new(), ttl }
    }

    fn cached(&self, key: &str) -> Option<Vec<EventModel>> {
        let entry = self.entries.get(key)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.models.clone())
    }

    fn store(&self, key: &str, models: Vec<EventModel>) {
        self.entries
            .insert(key.to_owned(), CacheEntry { models, fetched_at: Instant::now() });
    }

    /// Models interested in records from a source. View and metric sources
    /// resolve by source id; atomic-event sources resolve to the downstream
    /// dependents of the producing model.
    pub async fn resolve(&self, source: &DataSource) -> Result<Vec<EventModel>, AccessError> {
        match source.source_type.as_str() {
            "data_view" | "metric_data" => self.resolve_by_source(source).await,
            "event_model" => self.resolve_dependents(&source.source_id).await,
            _ => Ok(Vec::new()),
        }
    }

    async fn resolve_by_source(&self, source: &DataSource) -> Result<Vec<EventModel>, AccessError> {
        if let Some(models) = self.cached(&source.source_id) {
            return Ok(models);
        }
        let models = if source.source_type == "data_view" {
            self.access.get_event_models_by_source_id(&source.source_id).await?
        } else {
            Vec::new()
        };
        self.store(&source.source_id, models.clone());
        Ok(models)
    }

    async fn resolve_dependents(&self, model_id: &str) -> Result<Vec<EventModel>, AccessError> {
        let key = format!("{model_id}_depend");
        if let Some(models) = self.cached(&key) {
            return Ok(models);
        }

        let mut dependents = Vec::new();
        if let Some(model) = self.access.get_event_model_by_id(model_id).await? {
            for id in &model.downstream_dependent_model {
                if let Some(dependent) = self.access.get_event_model_by_id(id).await? {
                    dependents.push(dependent);
                }
            }
        }
        // An empty dependent list is not cached so a model wired up later
        // is picked up within one cycle.
        if !dependents.is_empty() {
            self.store(&key, dependents.clone());
        }
        Ok(dependents)
    }
}
