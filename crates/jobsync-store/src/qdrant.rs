//! Qdrant REST gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::gateway::{
    GatewayError, Payload, PointId, ScoredPoint, ScrollPage, SearchFilter, StoredPoint,
    VectorPoint, VectorStoreGateway,
};
use crate::http::{send_with_retry, BackoffPolicy};

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: "jobs".to_string(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSchema {
    Keyword,
    Datetime,
}

/// Shape of the collection created by `ensure_collection`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub vector_size: usize,
    pub hnsw_m: u32,
    pub hnsw_ef_construct: u32,
    pub default_segment_number: u32,
    pub payload_indexes: Vec<(String, PayloadSchema)>,
}

impl CollectionSpec {
    pub fn jobs(vector_size: usize) -> Self {
        let keyword = |name: &str| (name.to_string(), PayloadSchema::Keyword);
        Self {
            vector_size,
            hnsw_m: 16,
            hnsw_ef_construct: 100,
            default_segment_number: 2,
            payload_indexes: vec![
                keyword("title"),
                keyword("company"),
                keyword("location"),
                keyword("posted_date"),
                keyword("source"),
                keyword("listing_id"),
                ("processed_timestamp".to_string(), PayloadSchema::Datetime),
            ],
        }
    }

    fn create_body(&self) -> JsonValue {
        json!({
            "vectors": {"size": self.vector_size, "distance": "Cosine"},
            "hnsw_config": {"m": self.hnsw_m, "ef_construct": self.hnsw_ef_construct},
            "optimizers_config": {"default_segment_number": self.default_segment_number},
        })
    }
}

pub struct QdrantGateway {
    client: Client,
    base_url: String,
    collection: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<RawPoint>,
    #[serde(default)]
    next_page_offset: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    id: JsonValue,
    #[serde(default)]
    payload: Option<Payload>,
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Serialize)]
struct ScrollRequest {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<PointId>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a SearchFilter>,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_threshold: Option<f32>,
    with_payload: bool,
}

fn point_id(value: &JsonValue) -> Result<PointId, GatewayError> {
    value
        .as_u64()
        .ok_or_else(|| GatewayError::Decode(format!("unsupported point id {value}")))
}

impl QdrantGateway {
    pub fn new(config: QdrantConfig) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            let value = HeaderValue::from_str(key.trim())
                .map_err(|e| GatewayError::Unavailable(format!("invalid Qdrant API key: {e}")))?;
            headers.insert("api-key", value);
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection,
            backoff: config.backoff,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn check(operation: &'static str, resp: Response) -> Result<Response, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(GatewayError::Status {
            operation,
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(
        operation: &'static str,
        resp: Response,
    ) -> Result<T, GatewayError> {
        let resp = Self::check(operation, resp).await?;
        let parsed: QdrantResponse<T> = resp
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("{operation}: {e}")))?;
        Ok(parsed.result)
    }

    /// Creates the collection and its payload indexes if the collection is
    /// missing. An existing collection is never dropped or reconfigured.
    /// Returns whether the collection was created.
    pub async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<bool, GatewayError> {
        let url = self.collection_url("");
        let resp = send_with_retry(&self.backoff, || self.client.get(&url)).await?;
        if resp.status().is_success() {
            info!(collection = %self.collection, "collection already exists");
            return Ok(false);
        }
        if resp.status() != StatusCode::NOT_FOUND {
            Self::check("get collection", resp).await?;
        }

        let body = spec.create_body();
        let resp = send_with_retry(&self.backoff, || self.client.put(&url).json(&body)).await?;
        Self::check("create collection", resp).await?;
        info!(collection = %self.collection, size = spec.vector_size, "created collection");

        let index_url = self.collection_url("/index?wait=true");
        for (field, schema) in &spec.payload_indexes {
            let body = json!({"field_name": field, "field_schema": schema});
            let resp =
                send_with_retry(&self.backoff, || self.client.put(&index_url).json(&body)).await?;
            Self::check("create payload index", resp).await?;
            debug!(field = %field, "created payload index");
        }
        Ok(true)
    }
}

#[async_trait]
impl VectorStoreGateway for QdrantGateway {
    async fn scroll_page(
        &self,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<ScrollPage, GatewayError> {
        let url = self.collection_url("/points/scroll");
        let body = ScrollRequest {
            limit,
            offset,
            with_payload: true,
            with_vector: false,
        };
        let resp = send_with_retry(&self.backoff, || self.client.post(&url).json(&body)).await?;
        let result: ScrollResult = Self::decode("scroll", resp).await?;
        let points = result
            .points
            .into_iter()
            .map(|raw| {
                Ok(StoredPoint {
                    id: point_id(&raw.id)?,
                    payload: raw.payload.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;
        let next_offset = match result.next_page_offset {
            None | Some(JsonValue::Null) => None,
            Some(value) => Some(point_id(&value)?),
        };
        Ok(ScrollPage {
            points,
            next_offset,
        })
    }

    async fn upsert(&self, point: VectorPoint) -> Result<(), GatewayError> {
        let url = self.collection_url("/points?wait=true");
        let body = json!({ "points": [point] });
        let resp = send_with_retry(&self.backoff, || self.client.put(&url).json(&body)).await?;
        Self::check("upsert", resp).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[PointId]) -> Result<(), GatewayError> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = self.collection_url("/points/delete?wait=true");
        let body = json!({ "points": ids });
        let resp = send_with_retry(&self.backoff, || self.client.post(&url).json(&body)).await?;
        Self::check("delete", resp).await?;
        Ok(())
    }

    async fn filtered_search(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, GatewayError> {
        let url = self.collection_url("/points/search");
        let body = SearchRequest {
            vector,
            filter: (!filter.is_empty()).then_some(filter),
            limit,
            score_threshold,
            with_payload: true,
        };
        let resp = send_with_retry(&self.backoff, || self.client.post(&url).json(&body)).await?;
        let hits: Vec<RawPoint> = Self::decode("search", resp).await?;
        let mut scored = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(score) = hit.score else {
                warn!(id = %hit.id, "search hit without score");
                continue;
            };
            scored.push(ScoredPoint {
                id: point_id(&hit.id)?,
                payload: hit.payload.unwrap_or_default(),
                score,
            });
        }
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_collection_spec_matches_reference_layout() {
        let spec = CollectionSpec::jobs(384);
        assert_eq!(
            spec.create_body(),
            json!({
                "vectors": {"size": 384, "distance": "Cosine"},
                "hnsw_config": {"m": 16, "ef_construct": 100},
                "optimizers_config": {"default_segment_number": 2},
            })
        );
        assert!(spec
            .payload_indexes
            .contains(&("processed_timestamp".to_string(), PayloadSchema::Datetime)));
        assert_eq!(
            serde_json::to_value(PayloadSchema::Keyword).unwrap(),
            json!("keyword")
        );
    }

    #[test]
    fn scroll_response_decodes_with_and_without_offset() {
        let body = r#"{"result":{"points":[{"id":555,"payload":{"title":"Dev"}}],"next_page_offset":556},"status":"ok","time":0.001}"#;
        let parsed: QdrantResponse<ScrollResult> = serde_json::from_str(body).unwrap();
        assert_eq!(point_id(&parsed.result.points[0].id).unwrap(), 555);
        assert_eq!(parsed.result.next_page_offset, Some(json!(556)));

        let body = r#"{"result":{"points":[],"next_page_offset":null}}"#;
        let parsed: QdrantResponse<ScrollResult> = serde_json::from_str(body).unwrap();
        assert!(parsed.result.points.is_empty());
    }

    #[test]
    fn uuid_point_ids_are_rejected() {
        assert!(point_id(&json!("5c56c793-69f3-4fbf-87e6-c4bf54c28c26")).is_err());
    }

    #[test]
    fn scroll_request_omits_missing_offset() {
        let req = ScrollRequest {
            limit: 100,
            offset: None,
            with_payload: true,
            with_vector: false,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"limit": 100, "with_payload": true, "with_vector": false})
        );
    }
}
