//! HTTP adapter for a PostgREST-style remote store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::{Filter, Query, RemoteStore};

/// Remote store reached over its REST endpoint.
pub struct RestStore {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestStore {
    /// Create a store client for `base_url` using the project's API key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Authenticate requests as a signed-in user instead of with the bare API key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.http
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    /// Check status and decode the row array.
    async fn handle_response(&self, response: reqwest::Response) -> Result<Vec<Value>, SyncError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                SyncError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            warn!(target: "huddle::network", %status, "remote store request failed");
            return Err(SyncError::from_status(status, &text));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

/// Render query filters as PostgREST query parameters.
fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{}", value)),
            Filter::In { column, values } => {
                (column.clone(), format!("in.({})", values.join(",")))
            }
            Filter::Contains { column, pattern } => {
                (column.clone(), format!("ilike.*{}*", pattern))
            }
        })
        .collect()
}

fn id_param(id: Uuid) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, SyncError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(filter_params(&query.filters));
        if let Some(order) = &query.order {
            let direction = if order.descending { "desc" } else { "asc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        debug!(target: "huddle::network", table = %query.table, "select");
        let response = self
            .request(reqwest::Method::GET, &query.table)
            .query(&params)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, SyncError> {
        debug!(target: "huddle::network", table, "insert");
        let response = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        self.handle_response(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SyncError::InvalidResponse(format!("insert into {} returned no row", table))
            })
    }

    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, SyncError> {
        debug!(target: "huddle::network", table, %id, "update");
        let response = self
            .request(reqwest::Method::PATCH, table)
            .query(&id_param(id))
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        self.handle_response(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound {
                table: table.to_string(),
                id,
            })
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), SyncError> {
        debug!(target: "huddle::network", table, %id, "delete");
        let response = self
            .request(reqwest::Method::DELETE, table)
            .query(&id_param(id))
            .send()
            .await?;
        self.handle_response(response).await?;
        Ok(())
    }
}
