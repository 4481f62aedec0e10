use jobsync_core::{payload_source, payload_str};
use jobsync_store::{Embedder, PointId, SearchFilter, VectorStoreGateway};
use serde::Serialize;

use crate::SyncError;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub skills: Vec<String>,
    pub job_type: Option<String>,
    pub location: Option<String>,
    pub limit: usize,
    pub score_threshold: Option<f32>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            skills: Vec::new(),
            job_type: None,
            location: None,
            limit: DEFAULT_SEARCH_LIMIT,
            score_threshold: None,
        }
    }

    /// Query words, skills and job type, space-joined.
    pub fn embedding_text(&self) -> String {
        std::iter::once(self.text.as_str())
            .chain(self.skills.iter().map(String::as_str))
            .chain(self.job_type.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn filter(&self) -> SearchFilter {
        let mut filter = SearchFilter::default();
        if let Some(location) = self.location.as_deref().filter(|l| !l.trim().is_empty()) {
            filter = filter.text("location", location.trim());
        }
        if let Some(job_type) = self.job_type.as_deref().filter(|t| !t.trim().is_empty()) {
            filter = filter.text("job_type", job_type.trim());
        }
        filter
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: PointId,
    pub score: f32,
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub job_url: String,
}

pub async fn search_jobs(
    gateway: &dyn VectorStoreGateway,
    embedder: &dyn Embedder,
    query: &SearchQuery,
) -> Result<Vec<SearchHit>, SyncError> {
    let vector = embedder.embed(&query.embedding_text()).await?;
    let hits = gateway
        .filtered_search(&vector, &query.filter(), query.limit, query.score_threshold)
        .await?;
    Ok(hits
        .into_iter()
        .map(|hit| {
            let field = |key: &str| payload_str(&hit.payload, key).unwrap_or_default();
            SearchHit {
                id: hit.id,
                score: hit.score,
                source: payload_source(&hit.payload).to_string(),
                title: field("title"),
                company: field("company"),
                location: field("location"),
                job_url: field("job_url"),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_store::{InMemoryGateway, MockEmbedder};
    use serde_json::json;

    #[test]
    fn query_text_and_filters() {
        let mut query = SearchQuery::new(" rust developer ");
        query.skills = vec!["Tokio".into(), " ".into()];
        query.job_type = Some("Full-time".into());
        query.location = Some("Colombo".into());
        assert_eq!(query.embedding_text(), "rust developer Tokio Full-time");
        assert_eq!(
            query.filter(),
            SearchFilter::default()
                .text("location", "Colombo")
                .text("job_type", "Full-time")
        );
        assert!(SearchQuery::new("x").filter().is_empty());
    }

    #[tokio::test]
    async fn search_maps_payloads_and_applies_filter() {
        let store = InMemoryGateway::new();
        let embedder = MockEmbedder::default();
        for (id, title, location) in [(1, "Rust Engineer", "Colombo"), (2, "Rust Engineer", "Kandy")] {
            let vector = embedder.embed(&format!("{title} Acme {location}")).await.unwrap();
            let payload = json!({"title": title, "company": "Acme", "location": location, "source": "topjobs"});
            store.seed(id, vector, payload.as_object().cloned().unwrap()).await;
        }
        let mut query = SearchQuery::new("Rust Engineer Acme Colombo");
        query.location = Some("Kandy".into());
        let hits = search_jobs(&store, &embedder, &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
        assert_eq!(hits[0].source, "topjobs");
        assert_eq!(hits[0].job_url, "");
    }
}
