//! Reconciliation engine: the insert pass plus the expiry and
//! duplicate-collapse sweeps, each an independent re-runnable pass.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jobsync_core::{
    derive_stable_id, embedding_text_from_payload, payload_completeness, payload_source,
    payload_str, payload_timestamp, Job, SourceKind, LISTING_ID_KEY,
};
use jobsync_store::{
    scroll_all, BackoffPolicy, Embedder, GatewayError, PointId, StoredPoint, VectorPoint,
    VectorStoreGateway,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Stored jobs whose `processed_timestamp` is older than this are expired.
    pub expiry: Duration,
    pub scroll_page_size: usize,
    /// Retries for a failed scroll page before the store counts as unavailable.
    pub scroll_retry: BackoffPolicy,
    /// Maximum ids per delete call.
    pub delete_chunk: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::days(30),
            scroll_page_size: 100,
            scroll_retry: BackoffPolicy::default(),
            delete_chunk: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub inserted: usize,
    pub inserted_ids: Vec<PointId>,
    pub skipped_duplicate: usize,
    pub embedding_failures: usize,
    pub deleted_expired: usize,
    pub deleted_duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepResult {
    pub deleted_expired: usize,
    pub deleted_duplicates: usize,
    /// Points kept because their timestamp was missing or unreadable.
    pub retained_undated: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReembedResult {
    pub reembedded: usize,
    pub failures: usize,
}

pub struct ReconciliationEngine {
    gateway: Arc<dyn VectorStoreGateway>,
    embedder: Arc<dyn Embedder>,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn VectorStoreGateway>,
        embedder: Arc<dyn Embedder>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            gateway,
            embedder,
            config,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn VectorStoreGateway> {
        &self.gateway
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn all_points(&self) -> Result<Vec<StoredPoint>, GatewayError> {
        scroll_all(self.gateway.as_ref(), self.config.scroll_page_size)
            .with_retry(self.config.scroll_retry)
            .collect_all()
            .await
    }

    /// Ids currently present in the store, read by paging to exhaustion.
    pub async fn known_ids(&self) -> Result<HashSet<PointId>, GatewayError> {
        let mut ids = HashSet::new();
        let mut scroller = scroll_all(self.gateway.as_ref(), self.config.scroll_page_size)
            .with_retry(self.config.scroll_retry);
        while let Some(page) = scroller.next_page().await? {
            ids.extend(page.into_iter().map(|p| p.id));
        }
        Ok(ids)
    }

    /// Insert pass only: embeds and upserts jobs whose id is neither stored
    /// nor already seen earlier in the batch. New jobs are stamped with `now`.
    pub async fn ingest_at(
        &self,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<ReconciliationResult, GatewayError> {
        let known = self.known_ids().await?;
        let mut seen = HashSet::new();
        let mut result = ReconciliationResult::default();

        for job in jobs {
            if known.contains(&job.stable_id) || !seen.insert(job.stable_id) {
                debug!(stable_id = job.stable_id, listing_id = %job.listing_id, "duplicate listing");
                result.skipped_duplicate += 1;
                continue;
            }
            let vector = match self.embedder.embed(&job.embedding_text()).await {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(stable_id = job.stable_id, error = %err, "embedding failed; job skipped");
                    result.embedding_failures += 1;
                    continue;
                }
            };
            let mut stamped = job.clone();
            stamped.processed_timestamp = Some(now);
            let payload = stamped.to_payload().map_err(|e| {
                GatewayError::Decode(format!("encoding payload for {}: {e}", job.stable_id))
            })?;
            self.gateway
                .upsert(VectorPoint {
                    id: job.stable_id,
                    vector,
                    payload,
                })
                .await?;
            result.inserted += 1;
            result.inserted_ids.push(job.stable_id);
        }

        info!(
            inserted = result.inserted,
            skipped_duplicate = result.skipped_duplicate,
            embedding_failures = result.embedding_failures,
            "insert pass complete"
        );
        Ok(result)
    }

    async fn delete_chunked(&self, ids: &[PointId]) -> Result<(), GatewayError> {
        for chunk in ids.chunks(self.config.delete_chunk.max(1)) {
            self.gateway.delete(chunk).await?;
        }
        Ok(())
    }

    /// Deletes every point older than the expiry threshold. Returns the
    /// number deleted and the number kept for lack of a readable timestamp.
    pub async fn expire_at(&self, now: DateTime<Utc>) -> Result<(usize, usize), GatewayError> {
        let mut expired = Vec::new();
        let mut undated = 0usize;
        let mut scroller = scroll_all(self.gateway.as_ref(), self.config.scroll_page_size)
            .with_retry(self.config.scroll_retry);
        while let Some(page) = scroller.next_page().await? {
            for point in page {
                match payload_timestamp(&point.payload) {
                    Some(ts) if now.signed_duration_since(ts) > self.config.expiry => {
                        expired.push(point.id)
                    }
                    Some(_) => {}
                    None => {
                        debug!(id = point.id, "point has no readable processed_timestamp");
                        undated += 1;
                    }
                }
            }
        }
        self.delete_chunked(&expired).await?;
        if undated > 0 {
            warn!(undated, "retained points without a readable processed_timestamp");
        }
        info!(deleted = expired.len(), "expiry sweep complete");
        Ok((expired.len(), undated))
    }

    /// Keeps one point per `(source, listing_id)` across the whole store.
    pub async fn collapse_duplicates(&self) -> Result<usize, GatewayError> {
        let points = self.all_points().await?;
        let mut groups: HashMap<(SourceKind, String), Vec<StoredPoint>> = HashMap::new();
        for point in points {
            let Some(listing_id) = payload_str(&point.payload, LISTING_ID_KEY) else {
                continue;
            };
            groups
                .entry((payload_source(&point.payload), listing_id))
                .or_default()
                .push(point);
        }

        let mut doomed = Vec::new();
        for ((source, listing_id), mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by_key(|p| Reverse(survivor_rank(p, &source, &listing_id)));
            let keep = group[0].id;
            let dropped: Vec<PointId> = group[1..].iter().map(|p| p.id).collect();
            info!(%source, %listing_id, keep, ?dropped, "collapsing duplicate listing");
            doomed.extend(dropped);
        }
        doomed.sort_unstable();
        self.delete_chunked(&doomed).await?;
        info!(deleted = doomed.len(), "duplicate-collapse sweep complete");
        Ok(doomed.len())
    }

    /// Expiry then duplicate-collapse.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepResult, GatewayError> {
        let (deleted_expired, retained_undated) = self.expire_at(now).await?;
        let deleted_duplicates = self.collapse_duplicates().await?;
        Ok(SweepResult {
            deleted_expired,
            deleted_duplicates,
            retained_undated,
        })
    }

    pub async fn reconcile(&self, jobs: &[Job]) -> Result<ReconciliationResult, GatewayError> {
        self.reconcile_at(jobs, Utc::now()).await
    }

    /// Insert pass, then both sweeps. An empty or all-duplicate batch still sweeps.
    pub async fn reconcile_at(
        &self,
        jobs: &[Job],
        now: DateTime<Utc>,
    ) -> Result<ReconciliationResult, GatewayError> {
        let mut result = self.ingest_at(jobs, now).await?;
        let sweep = self.sweep_at(now).await?;
        result.deleted_expired = sweep.deleted_expired;
        result.deleted_duplicates = sweep.deleted_duplicates;
        Ok(result)
    }

    /// Recomputes every stored vector from its payload, leaving the payload
    /// (including `processed_timestamp`) untouched.
    pub async fn reembed_all(&self) -> Result<ReembedResult, GatewayError> {
        let mut result = ReembedResult::default();
        for point in self.all_points().await? {
            let text = embedding_text_from_payload(&point.payload);
            match self.embedder.embed(&text).await {
                Ok(vector) => {
                    self.gateway
                        .upsert(VectorPoint {
                            id: point.id,
                            vector,
                            payload: point.payload,
                        })
                        .await?;
                    result.reembedded += 1;
                }
                Err(err) => {
                    warn!(id = point.id, error = %err, "re-embedding failed; point left as is");
                    result.failures += 1;
                }
            }
        }
        info!(
            reembedded = result.reembedded,
            failures = result.failures,
            model = self.embedder.name(),
            "re-embedding complete"
        );
        Ok(result)
    }

    /// Stored job count per source.
    pub async fn store_stats(&self) -> Result<BTreeMap<String, usize>, GatewayError> {
        let mut totals = BTreeMap::new();
        let mut scroller = scroll_all(self.gateway.as_ref(), self.config.scroll_page_size)
            .with_retry(self.config.scroll_retry);
        while let Some(page) = scroller.next_page().await? {
            for point in page {
                *totals
                    .entry(payload_source(&point.payload).to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(totals)
    }
}

/// Higher ranks survive a collapse: canonical id first, then payload
/// completeness, then recency, then the lower id.
fn survivor_rank(
    point: &StoredPoint,
    source: &SourceKind,
    listing_id: &str,
) -> (bool, usize, Option<DateTime<Utc>>, Reverse<PointId>) {
    (
        point.id == derive_stable_id(source, listing_id),
        payload_completeness(&point.payload),
        payload_timestamp(&point.payload),
        Reverse(point.id),
    )
}
