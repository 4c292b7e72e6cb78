//! HTTP implementations of the access ports, used by the binary. Tests use
//! hand-rolled in-memory implementations instead.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::model::{EventModel, EventQuery, SourceRecords};

use super::{AccessError, DataModelQuery, EventModelAccess, PermissionService};

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AccessError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AccessError::Service { status: status.as_u16(), message })
}

/// Event-model service client.
pub struct HttpEventModelAccess {
    client: Client,
    base_url: String,
}

impl HttpEventModelAccess {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl EventModelAccess for HttpEventModelAccess {
    async fn get_event_model_by_id(&self, id: &str) -> Result<Option<EventModel>, AccessError> {
        let url = format!("{}/api/v1/event-models/{id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let model = response.json::<EventModel>().await?;
        Ok(Some(model))
    }

    async fn get_event_models_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Vec<EventModel>, AccessError> {
        let url = format!("{}/api/v1/event-models", self.base_url);
        let response =
            self.client.get(&url).query(&[("source_id", source_id)]).send().await?;
        let response = check_status(response).await?;
        let models = response.json::<Vec<EventModel>>().await?;
        Ok(models)
    }
}

#[derive(Serialize)]
struct SourceRecordsRequest<'a> {
    model: &'a EventModel,
    query: &'a EventQuery,
}

/// Data-model query client. The backing service routes on the model's
/// `data_source_type` (data view, metric model or event model).
pub struct HttpDataModelQuery {
    client: Client,
    base_url: String,
}

impl HttpDataModelQuery {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl DataModelQuery for HttpDataModelQuery {
    async fn fetch_source_records(
        &self,
        model: &EventModel,
        query: &EventQuery,
    ) -> Result<SourceRecords, AccessError> {
        let url = format!("{}/api/v1/source-records", self.base_url);
        let body = SourceRecordsRequest { model, query };
        let response = self.client.post(&url).json(&body).send().await?;
        let response = check_status(response).await?;
        let records = response.json::<SourceRecords>().await?;
        Ok(records)
    }
}

#[derive(Serialize)]
struct PermissionRequest<'a> {
    user_id: &'a str,
    resource: &'a str,
    action: &'a str,
}

#[derive(Deserialize)]
struct PermissionResponse {
    allowed: bool,
}

/// Permission service client.
pub struct HttpPermissionService {
    client: Client,
    base_url: String,
}

impl HttpPermissionService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl PermissionService for HttpPermissionService {
    async fn check_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, AccessError> {
        let url = format!("{}/api/v1/permissions/check", self.base_url);
        let body = PermissionRequest { user_id, resource, action };
        let response = self.client.post(&url).json(&body).send().await?;
        let response = check_status(response).await?;
        let verdict = response.json::<PermissionResponse>().await?;
        Ok(verdict.allowed)
    }
}
