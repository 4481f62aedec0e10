//! Embedding generation: the `Embedder` seam plus an HTTP client for
//! OpenAI-compatible `/embeddings` servers and a deterministic mock.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{send_with_retry, BackoffPolicy};

/// Output size of all-MiniLM-L6-v2.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embedding service returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding response could not be decoded: {0}")]
    Decode(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
}

/// Pure `text -> vector` function for a fixed model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn dimension(&self) -> usize;

    /// Model identifier, for logs and reports.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimension: usize,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_key: None,
            dimension: DEFAULT_EMBEDDING_DIM,
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Client for any server speaking the OpenAI embeddings protocol
/// (text-embeddings-inference, Ollama, vLLM, OpenAI itself).
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    backoff: BackoffPolicy,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self, EmbedError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            let auth = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|e| EmbedError::Unavailable(format!("invalid embedding API key: {e}")))?;
            headers.insert(AUTHORIZATION, auth);
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model,
            dimension: config.dimension,
            backoff: config.backoff,
        })
    }
}

fn check_dimension(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbedError> {
    if vector.len() != expected {
        return Err(EmbedError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };
        let resp = send_with_retry(&self.backoff, || {
            self.client.post(&self.endpoint).json(&request)
        })
        .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Decode(e.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Decode("response carried no embeddings".into()))?;
        check_dimension(vector, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Deterministic embedder for tests and offline runs: the vector is derived
/// from the text bytes and unit-normalized (all zeros for empty text).
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let bytes = text.as_bytes();
        let mut vector = vec![0.0f32; self.dimension];
        if !bytes.is_empty() {
            for (i, val) in vector.iter_mut().enumerate() {
                let byte = bytes[i % bytes.len()] as f32;
                *val = ((byte + i as f32) % 256.0) / 256.0;
            }
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic_and_sized() {
        let embedder = MockEmbedder::default();
        let a = embedder.embed("Backend Engineer Acme Remote").await.unwrap();
        let b = embedder.embed("Backend Engineer Acme Remote").await.unwrap();
        let c = embedder.embed("Frontend Engineer Acme Remote").await.unwrap();
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn mock_embeds_empty_text() {
        let embedding = MockEmbedder::new(8).embed("").await.unwrap();
        assert_eq!(embedding, vec![0.0; 8]);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        assert!(matches!(
            check_dimension(vec![0.1; 3], 384),
            Err(EmbedError::DimensionMismatch {
                expected: 384,
                actual: 3
            })
        ));
        assert_eq!(check_dimension(vec![0.1; 2], 2).unwrap().len(), 2);
    }

    #[test]
    fn request_uses_openai_shape() {
        let body = serde_json::to_value(EmbeddingRequest {
            model: "all-MiniLM-L6-v2",
            input: ["hello"],
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"model": "all-MiniLM-L6-v2", "input": ["hello"]})
        );
    }

    #[test]
    fn embedder_is_object_safe() {
        fn _assert(_: &dyn Embedder) {}
    }
}
