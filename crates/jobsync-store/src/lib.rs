//! Vector store and embedding gateways, plus the shared HTTP plumbing.

pub mod embedding;
pub mod gateway;
pub mod http;
pub mod memory;
pub mod qdrant;

pub use embedding::{
    EmbedError, Embedder, HttpEmbedder, HttpEmbedderConfig, MockEmbedder, DEFAULT_EMBEDDING_DIM,
    DEFAULT_EMBEDDING_MODEL,
};
pub use gateway::{
    cosine_similarity, scroll_all, FieldCondition, GatewayError, MatchCondition, Payload, PointId,
    ScoredPoint, ScrollPage, Scroller, SearchFilter, StoredPoint, VectorPoint, VectorStoreGateway,
};
pub use http::{
    classify_reqwest_error, classify_status, send_with_retry, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::InMemoryGateway;
pub use qdrant::{CollectionSpec, PayloadSchema, QdrantConfig, QdrantGateway};

pub const CRATE_NAME: &str = "jobsync-store";
