//! REST client for the hosted record service
//!
//! Speaks the PostgREST dialect: one endpoint per collection, equality
//! filters as `field=eq.value` query parameters, `PATCH` for partial updates
//! and `Prefer: return=representation` so writes echo the stored rows.

use super::{Filter, Record, RecordStore, KEY_FIELD};
use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;

pub struct RestRecordStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestRecordStore {
    pub fn new(config: &StoreConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn request(&self, method: Method, collection: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.collection_url(collection))
            .header("Prefer", "return=representation");

        if let Some(key) = &self.api_key {
            req = req.header("apikey", key).bearer_auth(key);
        }
        req
    }

    async fn execute(&self, req: RequestBuilder) -> SyncResult<Vec<Record>> {
        let response = req
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Remote(format!(
                "request failed with status {status}: {body}"
            )));
        }

        response
            .json::<Vec<Record>>()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Render a filter as PostgREST query parameters
pub(crate) fn query_pairs(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|(field, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Null => "null".to_string(),
                other => other.to_string(),
            };
            let operator = if value.is_null() { "is" } else { "eq" };
            (field.clone(), format!("{operator}.{rendered}"))
        })
        .collect()
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn get(&self, collection: &str, key: &str) -> SyncResult<Record> {
        let req = self
            .request(Method::GET, collection)
            .query(&query_pairs(&Filter::by_key(key)))
            .query(&[("limit", "1")]);

        self.execute(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::not_found(collection, key))
    }

    async fn list(&self, collection: &str, filter: &Filter) -> SyncResult<Vec<Record>> {
        let req = self
            .request(Method::GET, collection)
            .query(&query_pairs(filter));
        self.execute(req).await
    }

    async fn insert(&self, collection: &str, fields: Record) -> SyncResult<Record> {
        if !fields.contains_key(KEY_FIELD) {
            return Err(SyncError::InvalidOperation(format!(
                "insert into `{collection}` without a key"
            )));
        }

        let req = self.request(Method::POST, collection).json(&fields);
        self.execute(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Remote(format!("insert into `{collection}` returned no row")))
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Record,
    ) -> SyncResult<Vec<Record>> {
        let req = self
            .request(Method::PATCH, collection)
            .query(&query_pairs(filter))
            .json(&fields);
        self.execute(req).await
    }
}
