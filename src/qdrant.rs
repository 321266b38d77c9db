//! Qdrant vector store over its REST API.
//!
//! Implements [`VectorStore`] against a single collection. Every request
//! goes through the shared retry executor; HTTP 429 and 5xx are retryable,
//! other non-success statuses are fatal.
//!
//! # Point ids
//!
//! Qdrant accepts unsigned integers or UUIDs as point ids. Numeric profile
//! ids (Instagram user ids) are used as-is; anything else is mapped to a
//! UUIDv5 in the URL namespace. The original id is always kept in the
//! payload under `profile_id`, which is what records and hits report.
//!
//! # Ranking
//!
//! Qdrant ranks by score only. To honour the id tie-break and the exact
//! window contract, a page request fetches the first `offset + limit + 1`
//! hits and cuts the window client-side with [`paginate`].

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use profile_fusion_core::models::{ProfilePayload, ProfileRecord};
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::{
    paginate, Condition, Distance, PayloadFilter, SearchHit, SearchPage, SearchParams, VectorStore,
};
use profile_fusion_core::{FusionError, Result};

use crate::config::{api_key_from_env, StoreConfig};
use crate::retry::retry;

/// Payload fields indexed at collection creation, with their schema.
const PAYLOAD_INDEXES: &[(&str, &str)] = &[
    ("username", "keyword"),
    ("account_type", "keyword"),
    ("category", "keyword"),
    ("follower_count", "integer"),
    ("is_private", "bool"),
];

pub struct QdrantStore {
    http: Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    timeout: Duration,
    exact: bool,
    hnsw_ef: usize,
    dimension: RwLock<Option<usize>>,
}

impl QdrantStore {
    pub fn new(config: &StoreConfig, policy: RetryPolicy) -> anyhow::Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(api_key_from_env(var)?),
            None => None,
        };
        Ok(Self {
            http: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key,
            policy,
            timeout: Duration::from_secs(config.timeout_secs),
            exact: config.exact_search,
            hnsw_ef: config.hnsw_ef,
            dimension: RwLock::new(None),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, path)
    }

    /// One HTTP round trip. `Ok(None)` means 404.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FusionError::external("qdrant", e.to_string(), true))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(FusionError::external(
                "qdrant",
                format!("HTTP {}: {}", status, text),
                retryable,
            ));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| FusionError::external("qdrant", e.to_string(), true))?;
        Ok(Some(json))
    }

    async fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let body = body.as_ref();
        retry(&self.policy, operation, self.timeout, || {
            self.send(method.clone(), path, body)
        })
        .await
    }

    /// Like [`call`](Self::call) but a 404 is an error.
    async fn call_required(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        self.call(operation, method, path, body)
            .await?
            .ok_or_else(|| {
                FusionError::external(
                    operation,
                    format!("collection '{}' not found", self.collection),
                    false,
                )
            })
    }

    async fn fetch_point(&self, profile_id: &str, with_vector: bool) -> Result<Option<Value>> {
        let body = json!({
            "ids": [point_id(profile_id)],
            "with_payload": true,
            "with_vector": with_vector,
        });
        let json = self
            .call_required("qdrant retrieve", Method::POST, "/points", Some(body))
            .await?;
        Ok(json
            .get("result")
            .and_then(Value::as_array)
            .and_then(|points| points.first())
            .cloned())
    }

    fn known_dimension(&self) -> Option<usize> {
        self.dimension.read().ok().and_then(|d| *d)
    }
}

/// Map a profile id to a Qdrant point id.
pub fn point_id(profile_id: &str) -> Value {
    match profile_id.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(Uuid::new_v5(&Uuid::NAMESPACE_URL, profile_id.as_bytes()).to_string()),
    }
}

/// Translate a payload filter into Qdrant's filter syntax.
pub fn to_qdrant_filter(filter: &PayloadFilter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|c| match c {
            Condition::Match { key, value } => json!({"key": key, "match": {"value": value}}),
            Condition::Range { key, gte, lte } => {
                let mut range = Map::new();
                if let Some(lo) = gte {
                    range.insert("gte".into(), json!(lo));
                }
                if let Some(hi) = lte {
                    range.insert("lte".into(), json!(hi));
                }
                json!({"key": key, "range": range})
            }
        })
        .collect();
    Some(json!({ "must": must }))
}

/// Rebuild a record from a Qdrant point (`retrieve` or `search` shape).
pub fn record_from_point(point: &Value) -> Option<ProfileRecord> {
    let mut payload = point.get("payload")?.as_object()?.clone();
    let id = match payload.remove("profile_id") {
        Some(Value::String(s)) => s,
        _ => match point.get("id")? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    };
    let vector = point
        .get("vector")
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
        .unwrap_or_default();
    Some(ProfileRecord {
        id,
        vector,
        payload: ProfilePayload::from_json(payload),
    })
}

/// Extra hits requested past the window so equal scores near its edge can
/// be re-ordered by id before pagination.
const TIE_OVERFETCH: usize = 16;

/// Number of hits to request for the window `[offset, offset + limit)`.
///
/// Qdrant orders equal scores arbitrarily, so the window is re-ranked
/// client-side. A run of equal scores longer than [`TIE_OVERFETCH`] that
/// straddles the fetch boundary can still place a higher id inside the
/// window.
fn fetch_size(offset: usize, limit: usize) -> usize {
    offset.saturating_add(limit).saturating_add(TIE_OVERFETCH)
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> Result<()> {
        let existing = self
            .call("qdrant collection info", Method::GET, "", None)
            .await?;

        if let Some(info) = existing {
            let size = info
                .pointer("/result/config/params/vectors/size")
                .and_then(Value::as_u64)
                .map(|s| s as usize);
            if let Some(size) = size {
                if size != dimension {
                    return Err(FusionError::DimensionMismatch {
                        expected: size,
                        actual: dimension,
                    });
                }
            }
        } else {
            let body = json!({
                "vectors": {"size": dimension, "distance": distance.to_string()},
            });
            self.call_required("qdrant create collection", Method::PUT, "", Some(body))
                .await?;
            for (field, schema) in PAYLOAD_INDEXES {
                let body = json!({"field_name": field, "field_schema": schema});
                self.call_required(
                    "qdrant create index",
                    Method::PUT,
                    "/index?wait=true",
                    Some(body),
                )
                .await?;
            }
            tracing::info!(collection = %self.collection, dimension, %distance, "created collection");
        }

        if let Ok(mut d) = self.dimension.write() {
            *d = Some(dimension);
        }
        Ok(())
    }

    async fn exists(&self, profile_id: &str) -> Result<bool> {
        Ok(self.fetch_point(profile_id, false).await?.is_some())
    }

    async fn get(&self, profile_id: &str) -> Result<Option<ProfileRecord>> {
        Ok(self
            .fetch_point(profile_id, true)
            .await?
            .as_ref()
            .and_then(record_from_point))
    }

    async fn upsert(&self, record: ProfileRecord) -> Result<()> {
        if let Some(expected) = self.known_dimension() {
            if record.vector.len() != expected {
                return Err(FusionError::DimensionMismatch {
                    expected,
                    actual: record.vector.len(),
                });
            }
        }
        let mut payload = record.payload.to_json();
        payload.insert("profile_id".into(), json!(record.id));
        let body = json!({
            "points": [{
                "id": point_id(&record.id),
                "vector": record.vector,
                "payload": payload,
            }]
        });
        self.call_required("qdrant upsert", Method::PUT, "/points?wait=true", Some(body))
            .await?;
        Ok(())
    }

    async fn set_payload(&self, profile_id: &str, fields: Map<String, Value>) -> Result<bool> {
        if !self.exists(profile_id).await? {
            return Ok(false);
        }
        let body = json!({
            "payload": fields,
            "points": [point_id(profile_id)],
        });
        self.call_required(
            "qdrant set payload",
            Method::POST,
            "/points/payload?wait=true",
            Some(body),
        )
        .await?;
        Ok(true)
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchPage> {
        if let Some(expected) = self.known_dimension() {
            if query.len() != expected {
                return Err(FusionError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        if params.limit == 0 {
            return Ok(SearchPage::default());
        }

        let fetch = fetch_size(params.offset, params.limit);
        let mut body = json!({
            "vector": query,
            "limit": fetch,
            "with_payload": true,
            "with_vector": false,
            "params": {"exact": self.exact, "hnsw_ef": self.hnsw_ef},
        });
        if let Some(filter) = to_qdrant_filter(&params.filter) {
            body["filter"] = filter;
        }
        if let Some(min) = params.min_score {
            body["score_threshold"] = json!(min);
        }

        let json = self
            .call_required("qdrant search", Method::POST, "/points/search", Some(body))
            .await?;
        let hits: Vec<SearchHit> = json
            .get("result")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|p| {
                        let score = p.get("score").and_then(Value::as_f64)? as f32;
                        Some(SearchHit {
                            record: record_from_point(p)?,
                            score,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(hits = hits.len(), offset = params.offset, "qdrant search");
        Ok(paginate(hits, params.offset, params.limit))
    }

    async fn count(&self) -> Result<usize> {
        let json = self
            .call_required(
                "qdrant count",
                Method::POST,
                "/points/count",
                Some(json!({"exact": true})),
            )
            .await?;
        Ok(json
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}
