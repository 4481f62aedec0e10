//! The narrow vector-store interface the reconciliation core depends on.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

use crate::http::BackoffPolicy;

pub type PointId = u64;
pub type Payload = JsonMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("vector store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("vector store {operation} returned http {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("vector store response could not be decoded: {0}")]
    Decode(String),
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
}

/// A point as read back during a scroll; vectors are never fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: PointId,
    pub payload: Payload,
}

/// A point to write: id, vector and flat payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorPoint {
    pub id: PointId,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: PointId,
    pub payload: Payload,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    /// Offset to pass to the next call; `None` once the store is exhausted.
    pub next_offset: Option<PointId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchCondition {
    /// Exact keyword equality.
    Value(String),
    /// Substring / full-text match.
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCondition {
    pub key: String,
    #[serde(rename = "match")]
    pub matcher: MatchCondition,
}

/// Conjunction of payload conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SearchFilter {
    pub must: Vec<FieldCondition>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn text(mut self, key: &str, text: impl Into<String>) -> Self {
        self.must.push(FieldCondition {
            key: key.to_string(),
            matcher: MatchCondition::Text(text.into()),
        });
        self
    }

    pub fn value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.must.push(FieldCondition {
            key: key.to_string(),
            matcher: MatchCondition::Value(value.into()),
        });
        self
    }

    /// Evaluates the filter against a payload locally.
    pub fn matches(&self, payload: &Payload) -> bool {
        self.must.iter().all(|cond| {
            let Some(field) = payload.get(&cond.key) else {
                return false;
            };
            let candidates: Vec<&str> = match field {
                JsonValue::String(s) => vec![s.as_str()],
                JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_str).collect(),
                _ => Vec::new(),
            };
            candidates.iter().any(|candidate| match &cond.matcher {
                MatchCondition::Value(v) => candidate == v,
                MatchCondition::Text(t) => candidate.contains(t.as_str()),
            })
        })
    }
}

/// Persistent vector index holding one point per stable job id.
///
/// Upserts overwrite by id; no multi-point transaction is implied.
#[async_trait]
pub trait VectorStoreGateway: Send + Sync {
    /// One page of the full-table iteration, starting at `offset` (`None` = start).
    async fn scroll_page(
        &self,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<ScrollPage, GatewayError>;

    async fn upsert(&self, point: VectorPoint) -> Result<(), GatewayError>;

    async fn delete(&self, ids: &[PointId]) -> Result<(), GatewayError>;

    /// Results in descending score order.
    async fn filtered_search(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, GatewayError>;
}

/// Lazy, resumable iteration over every point in the store.
pub struct Scroller<'a> {
    gateway: &'a dyn VectorStoreGateway,
    page_size: usize,
    offset: Option<PointId>,
    exhausted: bool,
    retry: BackoffPolicy,
}

pub fn scroll_all(gateway: &dyn VectorStoreGateway, page_size: usize) -> Scroller<'_> {
    Scroller {
        gateway,
        page_size: page_size.max(1),
        offset: None,
        exhausted: false,
        retry: BackoffPolicy::none(),
    }
}

impl<'a> Scroller<'a> {
    /// Continue from a page token recorded by an earlier, interrupted scroll.
    pub fn resume_from(mut self, offset: Option<PointId>) -> Self {
        self.offset = offset;
        self.exhausted = false;
        self
    }

    /// Re-request a failed page from the same offset before giving up.
    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Token of the next page to read.
    pub fn offset(&self) -> Option<PointId> {
        self.offset
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<StoredPoint>>, GatewayError> {
        if self.exhausted {
            return Ok(None);
        }
        let mut attempt = 0usize;
        let page = loop {
            match self.gateway.scroll_page(self.offset, self.page_size).await {
                Ok(page) => break page,
                Err(err) if attempt < self.retry.max_retries => {
                    warn!(offset = ?self.offset, attempt, error = %err, "scroll page failed; retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };
        self.exhausted = page.next_offset.is_none();
        self.offset = page.next_offset;
        if page.points.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.points))
    }

    pub async fn collect_all(mut self) -> Result<Vec<StoredPoint>, GatewayError> {
        let mut all = Vec::new();
        while let Some(points) = self.next_page().await? {
            all.extend(points);
        }
        Ok(all)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: JsonValue) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn filter_serializes_to_qdrant_shape() {
        let filter = SearchFilter::default()
            .text("location", "Colombo")
            .value("source", "topjobs");
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({"must": [
                {"key": "location", "match": {"text": "Colombo"}},
                {"key": "source", "match": {"value": "topjobs"}}
            ]})
        );
    }

    #[test]
    fn filter_matches_payloads_locally() {
        let p = payload(json!({"location": "Colombo 03, Sri Lanka", "source": "topjobs", "skills": ["Rust", "Go"]}));
        assert!(SearchFilter::default().matches(&p));
        assert!(SearchFilter::default().text("location", "Colombo").matches(&p));
        assert!(!SearchFilter::default().value("location", "Colombo").matches(&p));
        assert!(SearchFilter::default().value("skills", "Go").matches(&p));
        assert!(!SearchFilter::default().text("job_type", "Full").matches(&p));
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
