//! In-process vector store with the same semantics as the Qdrant gateway.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::gateway::{
    cosine_similarity, GatewayError, Payload, PointId, ScoredPoint, ScrollPage, SearchFilter,
    StoredPoint, VectorPoint, VectorStoreGateway,
};

/// Points are kept ordered by id, which is also the scroll order.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    points: Mutex<BTreeMap<PointId, VectorPoint>>,
    unavailable: AtomicBool,
    upserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }

    /// Seeds a point without counting it as an upsert.
    pub async fn seed(&self, id: PointId, vector: Vec<f32>, payload: Payload) {
        self.points
            .lock()
            .await
            .insert(id, VectorPoint { id, vector, payload });
    }

    pub async fn get(&self, id: PointId) -> Option<VectorPoint> {
        self.points.lock().await.get(&id).cloned()
    }

    pub async fn ids(&self) -> Vec<PointId> {
        self.points.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.points.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.lock().await.is_empty()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStoreGateway for InMemoryGateway {
    async fn scroll_page(
        &self,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<ScrollPage, GatewayError> {
        self.check_available()?;
        let points = self.points.lock().await;
        let mut iter = points.range(offset.unwrap_or(0)..);
        let page: Vec<StoredPoint> = iter
            .by_ref()
            .take(limit.max(1))
            .map(|(id, point)| StoredPoint {
                id: *id,
                payload: point.payload.clone(),
            })
            .collect();
        let next_offset = iter.next().map(|(id, _)| *id);
        Ok(ScrollPage {
            points: page,
            next_offset,
        })
    }

    async fn upsert(&self, point: VectorPoint) -> Result<(), GatewayError> {
        self.check_available()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.points.lock().await.insert(point.id, point);
        Ok(())
    }

    async fn delete(&self, ids: &[PointId]) -> Result<(), GatewayError> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut points = self.points.lock().await;
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn filtered_search(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, GatewayError> {
        self.check_available()?;
        let points = self.points.lock().await;
        let mut scored: Vec<ScoredPoint> = points
            .values()
            .filter(|point| filter.matches(&point.payload))
            .map(|point| ScoredPoint {
                id: point.id,
                payload: point.payload.clone(),
                score: cosine_similarity(vector, &point.vector),
            })
            .filter(|hit| score_threshold.map_or(true, |min| hit.score >= min))
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::scroll_all;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn scroll_pages_through_everything_and_is_resumable() {
        let store = InMemoryGateway::new();
        for id in [5, 1, 9, 3, 7] {
            store.seed(id, vec![1.0], payload(json!({"n": id}))).await;
        }

        let mut scroller = scroll_all(&store, 2);
        let first = scroller.next_page().await.unwrap().unwrap();
        assert_eq!(first.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3]);
        let token = scroller.offset();
        assert_eq!(token, Some(5));

        let rest = scroll_all(&store, 2).resume_from(token).collect_all().await.unwrap();
        assert_eq!(rest.iter().map(|p| p.id).collect::<Vec<_>>(), vec![5, 7, 9]);

        let all = scroll_all(&store, 100).collect_all().await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn empty_store_scrolls_to_nothing() {
        let store = InMemoryGateway::new();
        let mut scroller = scroll_all(&store, 10);
        assert!(scroller.next_page().await.unwrap().is_none());
        assert!(scroller.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let store = InMemoryGateway::new();
        for title in ["first", "second"] {
            store
                .upsert(VectorPoint {
                    id: 42,
                    vector: vec![0.5, 0.5],
                    payload: payload(json!({"title": title})),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(42).await.unwrap().payload["title"], json!("second"));
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn search_orders_by_score_and_applies_filter_and_threshold() {
        let store = InMemoryGateway::new();
        store.seed(1, vec![1.0, 0.0], payload(json!({"location": "Colombo"}))).await;
        store.seed(2, vec![0.7, 0.7], payload(json!({"location": "Colombo"}))).await;
        store.seed(3, vec![0.0, 1.0], payload(json!({"location": "Kandy"}))).await;

        let hits = store
            .filtered_search(&[1.0, 0.0], &SearchFilter::default(), 10, None)
            .await
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let hits = store
            .filtered_search(&[1.0, 0.0], &SearchFilter::default().text("location", "Colombo"), 10, Some(0.9))
            .await
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryGateway::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.scroll_page(None, 10).await,
            Err(GatewayError::Unavailable(_))
        ));
        assert!(store.delete(&[1]).await.is_err());
    }
}
