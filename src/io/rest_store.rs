//! HTTP remote store speaking a PostgREST-style API
//!
//! Tables: `crates` (id, latitude, longitude, fortune_id) and
//! `user_collections` (id, user_id, crate_id, collected_at, opened_at) with a
//! unique constraint on (user_id, crate_id); a violation answers 409.

use crate::domain::geo::bounding_deltas;
use crate::domain::types::{CollectionRecord, Crate, CrateId, FetchRequest, RecordId, UserId};
use crate::error::RemoteError;
use crate::infra::config::Config;
use crate::io::remote::RemoteStore;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const COLLECTION_COLUMNS: &str = "id,user_id,crate_id,collected_at,opened_at";

pub struct RestRemoteStore {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl RestRemoteStore {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = Client::builder()
            .timeout(Duration::from_millis(config.remote_timeout_ms()))
            .build()?;

        Ok(Self {
            base_url: config.remote_base_url().trim_end_matches('/').to_string(),
            api_key: config.remote_api_key().map(str::to_string),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, op: &'static str, request: RequestBuilder) -> Result<Response, RemoteError> {
        let start = Instant::now();
        let response = self.authorize(request).send().await.map_err(|e| {
            warn!(op = %op, error = %e, "remote_request_failed");
            RemoteError::unavailable(e.to_string())
        })?;

        let status = response.status();
        debug!(
            op = %op,
            status = %status.as_u16(),
            latency_ms = %start.elapsed().as_millis(),
            "remote_response"
        );

        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let body = response.text().await.map_err(|e| RemoteError::unavailable(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::CONFLICT => RemoteError::Duplicate,
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        _ => RemoteError::Unavailable(format!("{}: {}", status.as_u16(), body)),
    }
}

/// Query parameters for a bounding-box crate lookup around the request center
pub fn nearby_query(request: &FetchRequest) -> Vec<(String, String)> {
    let (lat_delta, lon_delta) = bounding_deltas(request.latitude, request.radius_m);
    vec![
        ("select".to_string(), "id,latitude,longitude,fortune_id".to_string()),
        ("latitude".to_string(), format!("gte.{}", request.latitude - lat_delta)),
        ("latitude".to_string(), format!("lte.{}", request.latitude + lat_delta)),
        ("longitude".to_string(), format!("gte.{}", request.longitude - lon_delta)),
        ("longitude".to_string(), format!("lte.{}", request.longitude + lon_delta)),
    ]
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn fetch_nearby(&self, request: &FetchRequest) -> Result<Vec<Crate>, RemoteError> {
        let http = self.client.get(self.table_url("crates")).query(&nearby_query(request));
        let response = self.send("fetch_nearby", http).await?;
        Self::decode(response).await
    }

    async fn record_collection(
        &self,
        user_id: &UserId,
        crate_id: &CrateId,
    ) -> Result<CollectionRecord, RemoteError> {
        let body = serde_json::json!({ "user_id": user_id, "crate_id": crate_id }).to_string();
        let http = self
            .client
            .post(self.table_url("user_collections"))
            .query(&[("select", COLLECTION_COLUMNS)])
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .body(body);

        let response = self.send("record_collection", http).await?;
        let mut rows: Vec<CollectionRecord> = Self::decode(response).await?;
        rows.pop().ok_or_else(|| RemoteError::Decode("insert returned no row".to_string()))
    }

    async fn mark_opened(&self, record_id: &RecordId) -> Result<(), RemoteError> {
        let body = serde_json::json!({ "opened_at": Utc::now() }).to_string();
        let http = self
            .client
            .patch(self.table_url("user_collections"))
            .query(&[("id", format!("eq.{record_id}")), ("select", "id".to_string())])
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .body(body);

        let response = self.send("mark_opened", http).await?;
        let rows: Vec<serde_json::Value> = Self::decode(response).await?;
        if rows.is_empty() {
            return Err(RemoteError::NotFound(record_id.to_string()));
        }
        Ok(())
    }

    async fn fetch_user_collections(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<CollectionRecord>, RemoteError> {
        let http = self.client.get(self.table_url("user_collections")).query(&[
            ("select", COLLECTION_COLUMNS.to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("order", "collected_at.desc".to_string()),
        ]);
        let response = self.send("fetch_user_collections", http).await?;
        Self::decode(response).await
    }
}
