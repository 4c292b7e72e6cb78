//! Event query service: the on-demand counterpart to the streaming
//! pipeline. Runs one or more event queries against stored or inline
//! (preview) models, merges the results, and paginates them.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::access::{AccessError, EventModelAccess, PermissionService};
use crate::engine::{assemble, EngineError, EventEngine};
use crate::model::{Event, EventDetailsQuery, EventModel, EventQuery, EventQueryReq, Locale};

/// Resource name checked before any query runs.
const PERMISSION_RESOURCE: &str = "event_model";
const PERMISSION_ACTION: &str = "query";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("user {user_id} is not allowed to query event models")]
    PermissionDenied { user_id: String },

    #[error("event model {id} not found")]
    ModelNotFound { id: String },

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A merged query result: the paginated page plus the pre-pagination total.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub events: Vec<Event>,
    pub total: usize,
}

pub struct EventQueryService {
    models: Arc<dyn EventModelAccess>,
    permissions: Arc<dyn PermissionService>,
    engine: Arc<EventEngine>,
    locale: Locale,
}

impl EventQueryService {
    pub fn new(
        models: Arc<dyn EventModelAccess>,
        permissions: Arc<dyn PermissionService>,
        engine: Arc<EventEngine>,
        locale: Locale,
    ) -> Self {
        Self { models, permissions, engine, locale }
    }

    /// Run every query in the request, merge the event lists, then sort and
    /// paginate the merged set with the request's outer parameters.
    pub async fn query(
        &self,
        user_id: &str,
        req: &EventQueryReq,
    ) -> Result<QueryResult, ServiceError> {
        self.authorize(user_id).await?;

        let mut merged = Vec::new();
        let mut total = 0;
        for query in &req.querys {
            let model = self.resolve_model(query).await?;
            let (events, count) = self.engine.apply(query, &model, self.locale).await?;
            debug!(model_id = %model.id, count, "query evaluated");
            total += count;
            merged.extend(events);
        }

        let events = assemble(merged, &req.sort_key, req.direction, req.limit, req.offset);
        Ok(QueryResult { events, total })
    }

    /// Look up one stored event by model and event id.
    pub async fn event_details(
        &self,
        user_id: &str,
        details: &EventDetailsQuery,
    ) -> Result<Event, ServiceError> {
        self.authorize(user_id).await?;
        let model = self
            .models
            .get_event_model_by_id(&details.event_model_id)
            .await?
            .ok_or_else(|| ServiceError::ModelNotFound { id: details.event_model_id.clone() })?;
        Ok(self.engine.query_event_by_id(&model, details).await?)
    }

    async fn authorize(&self, user_id: &str) -> Result<(), ServiceError> {
        let allowed = self
            .permissions
            .check_permission(user_id, PERMISSION_RESOURCE, PERMISSION_ACTION)
            .await?;
        if !allowed {
            return Err(ServiceError::PermissionDenied { user_id: user_id.to_owned() });
        }
        Ok(())
    }

    /// A stored query resolves its model by id; a preview query carries the
    /// model definition inline.
    async fn resolve_model(&self, query: &EventQuery) -> Result<EventModel, ServiceError> {
        if query.is_preview() {
            return Ok(preview_model(query));
        }
        self.models
            .get_event_model_by_id(&query.id)
            .await?
            .ok_or_else(|| ServiceError::ModelNotFound { id: query.id.clone() })
    }
}

/// Build a transient model from the inline fields of a preview query.
pub fn preview_model(query: &EventQuery) -> EventModel {
    EventModel {
        name: query.event_model_name.clone(),
        model_type: query.event_model_type.clone(),
        tags: query.event_model_tags.clone(),
        data_source_type: query.data_source_type.clone(),
        data_source: query.data_source.clone(),
        detect_rule: query.detect_rule.clone(),
        aggregate_rule: query.aggregate_rule.clone(),
        default_time_window: query.default_time_window.clone(),
        ..Default::default()
    }
}
