//! Ingestion orchestrator: sweeps once, then scrape -> normalize -> insert
//! for each source in turn, isolating per-source failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use jobsync_adapters::SourceScraper;
use jobsync_core::normalize_batch;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{ReconciliationEngine, SweepResult};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub scraped: usize,
    pub malformed: usize,
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub embedding_failures: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SourceReport {
    fn empty(source_id: String, status: SourceStatus) -> Self {
        Self {
            source_id,
            status,
            scraped: 0,
            malformed: 0,
            inserted: 0,
            skipped_duplicate: 0,
            embedding_failures: 0,
            error: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub embedder: String,
    pub sweep: SweepResult,
    pub sources: Vec<SourceReport>,
    /// Stored jobs per source after the run.
    pub store_totals: BTreeMap<String, usize>,
}

impl RunReport {
    fn count(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(SourceStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(SourceStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(SourceStatus::Cancelled)
    }

    pub fn total_inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.sources
            .iter()
            .all(|s| s.status == SourceStatus::Succeeded)
    }
}

pub struct IngestionOrchestrator {
    engine: ReconciliationEngine,
    shutdown: Arc<AtomicBool>,
}

impl IngestionOrchestrator {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self {
            engine,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag; once set, sources not yet started are cancelled.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub async fn run(&self, sources: &[Box<dyn SourceScraper>]) -> Result<RunReport, SyncError> {
        self.run_at(sources, Utc::now()).await
    }

    /// Only vector-store failures abort the run; scrape errors fail their
    /// source and embedding errors skip their job.
    pub async fn run_at(
        &self,
        sources: &[Box<dyn SourceScraper>],
        now: DateTime<Utc>,
    ) -> Result<RunReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, sources, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        sources: &[Box<dyn SourceScraper>],
        now: DateTime<Utc>,
    ) -> Result<RunReport, SyncError> {
        let started_at = Utc::now();
        info!(sources = sources.len(), "sync run starting");

        let sweep = self.engine.sweep_at(now).await?;

        let mut reports = Vec::with_capacity(sources.len());
        for scraper in sources {
            let source_id = scraper.source().to_string();
            if self.shutdown.load(Ordering::SeqCst) {
                warn!(source = %source_id, "shutdown requested; source cancelled");
                reports.push(SourceReport::empty(source_id, SourceStatus::Cancelled));
                continue;
            }
            let span = info_span!("source", source = %source_id);
            let report = self
                .run_source(source_id, scraper.as_ref(), now)
                .instrument(span)
                .await?;
            reports.push(report);
        }

        let store_totals = self.engine.store_stats().await?;
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            embedder: self.engine.embedder().name().to_string(),
            sweep,
            sources: reports,
            store_totals,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            inserted = report.total_inserted(),
            deleted_expired = report.sweep.deleted_expired,
            deleted_duplicates = report.sweep.deleted_duplicates,
            "sync run finished"
        );
        Ok(report)
    }

    async fn run_source(
        &self,
        source_id: String,
        scraper: &dyn SourceScraper,
        now: DateTime<Utc>,
    ) -> Result<SourceReport, SyncError> {
        let started = Instant::now();
        let raws = match scraper.scrape().await {
            Ok(raws) => raws,
            Err(err) => {
                error!(error = %err, "scrape failed; source contributes no jobs");
                let mut report = SourceReport::empty(source_id, SourceStatus::Failed);
                report.error = Some(err.to_string());
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }
        };

        let batch = normalize_batch(&raws);
        let result = self.engine.ingest_at(&batch.jobs, now).await?;
        let report = SourceReport {
            source_id,
            status: SourceStatus::Succeeded,
            scraped: raws.len(),
            malformed: batch.malformed,
            inserted: result.inserted,
            skipped_duplicate: result.skipped_duplicate,
            embedding_failures: result.embedding_failures,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            scraped = report.scraped,
            malformed = report.malformed,
            inserted = report.inserted,
            skipped_duplicate = report.skipped_duplicate,
            "source complete"
        );
        Ok(report)
    }
}
