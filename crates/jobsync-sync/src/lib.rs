//! Sync pipeline: configuration, source registry, reconciliation,
//! orchestration, run reports and the cron scheduler.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobsync_adapters::{scraper_for_source, PageSource, ScrapeOptions, SourceScraper};
use jobsync_store::{
    BackoffPolicy, CollectionSpec, EmbedError, Embedder, GatewayError, HttpClientConfig,
    HttpEmbedder, HttpEmbedderConfig, HttpFetcher, QdrantConfig, QdrantGateway,
    VectorStoreGateway, DEFAULT_EMBEDDING_DIM, DEFAULT_EMBEDDING_MODEL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, warn};

pub mod orchestrator;
pub mod reconcile;
pub mod report;
pub mod search;

pub use orchestrator::{IngestionOrchestrator, RunReport, SourceReport, SourceStatus};
pub use reconcile::{
    ReconcileConfig, ReconciliationEngine, ReconciliationResult, ReembedResult, SweepResult,
};
pub use report::{render_daily_brief, report_daily_markdown, write_run_reports};
pub use search::{search_jobs, SearchHit, SearchQuery, DEFAULT_SEARCH_LIMIT};

pub const CRATE_NAME: &str = "jobsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("vector store unavailable: {0}")]
    Store(#[from] GatewayError),
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Relative to the workspace root.
    #[serde(default)]
    pub fixture_paths: Vec<PathBuf>,
    #[serde(default)]
    pub detail_fixture_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub scrape: ScrapeOptions,
}

impl SourceConfig {
    pub fn page_source(&self, workspace_root: &Path, fetcher: &Arc<HttpFetcher>) -> PageSource {
        match self.mode {
            SourceMode::Live => PageSource::Live {
                fetcher: Arc::clone(fetcher),
                listing_urls: self.listing_urls.clone(),
            },
            SourceMode::Fixture => PageSource::Fixture {
                listing_paths: self
                    .fixture_paths
                    .iter()
                    .map(|p| workspace_root.join(p))
                    .collect(),
                detail_dir: self.detail_fixture_dir.as_ref().map(|d| workspace_root.join(d)),
            },
        }
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_collection: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_dim: usize,
    pub expiry_days: i64,
    pub scroll_page_size: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_interval_ms: u64,
    pub scheduler_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| text(key).unwrap_or_else(|| default.to_string());
        Self {
            qdrant_url: or("QDRANT_URL", "http://localhost:6333"),
            qdrant_api_key: text("QDRANT_API_KEY"),
            qdrant_collection: or("QDRANT_COLLECTION", "jobs"),
            embedding_url: or("EMBEDDING_URL", "http://localhost:8080/v1"),
            embedding_model: or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            embedding_api_key: text("EMBEDDING_API_KEY"),
            embedding_dim: text("EMBEDDING_DIM")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_EMBEDDING_DIM),
            expiry_days: text("JOBSYNC_EXPIRY_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scroll_page_size: text("JOBSYNC_SCROLL_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            user_agent: or("JOBSYNC_USER_AGENT", "Mozilla/5.0 (compatible; jobsync/0.1)"),
            http_timeout_secs: text("JOBSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            request_interval_ms: text("JOBSYNC_REQUEST_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500),
            scheduler_cron: or("JOBSYNC_SCHEDULER_CRON", "0 0 * * *"),
            workspace_root: PathBuf::from(or("JOBSYNC_WORKSPACE_ROOT", ".")),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            expiry: chrono::Duration::days(self.expiry_days),
            scroll_page_size: self.scroll_page_size,
            ..ReconcileConfig::default()
        }
    }

    pub fn qdrant_config(&self) -> QdrantConfig {
        QdrantConfig {
            url: self.qdrant_url.clone(),
            api_key: self.qdrant_api_key.clone(),
            collection: self.qdrant_collection.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn embedder_config(&self) -> HttpEmbedderConfig {
        HttpEmbedderConfig {
            base_url: self.embedding_url.clone(),
            model: self.embedding_model.clone(),
            api_key: self.embedding_api_key.clone(),
            dimension: self.embedding_dim,
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_interval: Duration::from_millis(self.request_interval_ms),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Creates the Qdrant collection and payload indexes when missing.
pub async fn init_collection(config: &SyncConfig) -> Result<bool> {
    let gateway = QdrantGateway::new(config.qdrant_config()).context("building Qdrant client")?;
    let created = gateway
        .ensure_collection(&CollectionSpec::jobs(config.embedding_dim))
        .await
        .with_context(|| format!("initializing collection {}", gateway.collection()))?;
    Ok(created)
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub report: RunReport,
    pub reports_dir: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    gateway: Arc<dyn VectorStoreGateway>,
    embedder: Arc<dyn Embedder>,
    fetcher: Arc<HttpFetcher>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    /// Wires Qdrant, the HTTP embedder and the page fetcher from `config`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let gateway = QdrantGateway::new(config.qdrant_config()).context("building Qdrant client")?;
        let embedder =
            HttpEmbedder::new(config.embedder_config()).context("building embedding client")?;
        Self::with_components(config, Arc::new(gateway), Arc::new(embedder))
    }

    pub fn with_components(
        config: SyncConfig,
        gateway: Arc<dyn VectorStoreGateway>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let fetcher =
            HttpFetcher::new(config.http_client_config()).context("building page fetcher")?;
        Ok(Self {
            config,
            gateway,
            embedder,
            fetcher: Arc::new(fetcher),
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn VectorStoreGateway> {
        &self.gateway
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.embedder),
            self.config.reconcile_config(),
        )
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        warn_on_empty_sources(&registry);
        Ok(registry)
    }

    pub fn build_scrapers(&self, registry: &SourceRegistry) -> Result<Vec<Box<dyn SourceScraper>>> {
        registry
            .enabled()
            .map(|source| {
                let pages = source.page_source(&self.config.workspace_root, &self.fetcher);
                scraper_for_source(&source.source_id, pages, source.scrape)
                    .with_context(|| format!("no scraper registered for {}", source.source_id))
            })
            .collect()
    }

    /// One orchestrated run plus its reports. Overlapping runs are refused.
    pub async fn run_once(&self, shutdown: Arc<AtomicBool>) -> Result<SyncRunSummary> {
        let _guard = self
            .run_lock
            .try_lock()
            .context("a sync run is already in progress")?;
        let registry = self.load_source_registry().await?;
        let scrapers = self.build_scrapers(&registry)?;
        let orchestrator = IngestionOrchestrator::new(self.engine()).with_shutdown(shutdown);
        let report = orchestrator.run(&scrapers).await?;
        let reports_dir = write_run_reports(&self.config.workspace_root, &report).await?;
        info!(run_id = %report.run_id, reports = %reports_dir.display(), "reports written");
        Ok(SyncRunSummary {
            report,
            reports_dir,
        })
    }

    /// Scheduler firing `run_once` on `scheduler_cron`; the caller starts it.
    pub async fn build_scheduler(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scheduler_cron.clone();
        let pipeline = Arc::clone(self);
        let job = CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let shutdown = Arc::clone(&shutdown);
            Box::pin(async move {
                match pipeline.run_once(shutdown).await {
                    Ok(summary) => info!(
                        run_id = %summary.report.run_id,
                        inserted = summary.report.total_inserted(),
                        failed = summary.report.failed(),
                        "scheduled sync complete"
                    ),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "scheduled sync failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub async fn run_sync_once_from_env(shutdown: Arc<AtomicBool>) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(shutdown).await
}

/// Logs and returns whether any enabled source is misconfigured for its mode.
pub fn warn_on_empty_sources(registry: &SourceRegistry) -> bool {
    let mut any = false;
    for source in registry.enabled() {
        let empty = match source.mode {
            SourceMode::Live => source.listing_urls.is_empty(),
            SourceMode::Fixture => source.fixture_paths.is_empty(),
        };
        if empty {
            warn!(source = %source.source_id, mode = ?source.mode, "source has no pages configured");
            any = true;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_store::{InMemoryGateway, MockEmbedder};
    use std::collections::HashMap;

    const REGISTRY: &str = r#"
sources:
  - source_id: linkedin
    display_name: LinkedIn
    mode: fixture
    fixture_paths: [fixtures/linkedin/sample/listing.html]
    detail_fixture_dir: fixtures/linkedin/sample/details
    fetch_details: true
    max_listings: 50
  - source_id: topjobs
    display_name: TopJobs
    enabled: false
    listing_urls: ["https://www.topjobs.lk/applicant/vacancybyfunctionalarea.jsp?FA=SDQ"]
"#;

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.qdrant_url, "http://localhost:6333");
        assert_eq!(config.qdrant_collection, "jobs");
        assert_eq!(config.embedding_dim, 384);
        assert_eq!(config.reconcile_config().expiry, chrono::Duration::days(30));
        assert_eq!(config.scroll_page_size, 100);
        assert_eq!(config.scheduler_cron, "0 0 * * *");

        let env = HashMap::from([
            ("JOBSYNC_EXPIRY_DAYS", "7"),
            ("EMBEDDING_DIM", "not-a-number"),
            ("QDRANT_API_KEY", "   "),
            ("JOBSYNC_WORKSPACE_ROOT", "/srv/jobsync"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.expiry_days, 7);
        assert_eq!(config.embedding_dim, 384);
        assert_eq!(config.qdrant_api_key, None);
        assert_eq!(config.sources_path(), PathBuf::from("/srv/jobsync/sources.yaml"));
    }

    #[test]
    fn registry_parses_modes_and_scrape_options() {
        let registry: SourceRegistry = serde_yaml::from_str(REGISTRY).unwrap();
        let linkedin = &registry.sources[0];
        assert_eq!(linkedin.mode, SourceMode::Fixture);
        assert!(linkedin.enabled);
        assert!(linkedin.scrape.fetch_details);
        assert_eq!(linkedin.scrape.max_listings, 50);
        assert_eq!(linkedin.scrape.max_detail_pages, ScrapeOptions::default().max_detail_pages);

        let topjobs = &registry.sources[1];
        assert_eq!(topjobs.mode, SourceMode::Live);
        assert_eq!(topjobs.scrape, ScrapeOptions::default());
        assert_eq!(registry.enabled().count(), 1);
        assert!(!warn_on_empty_sources(&registry));
    }

    #[test]
    fn fixture_paths_resolve_against_workspace_root() {
        let registry: SourceRegistry = serde_yaml::from_str(REGISTRY).unwrap();
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        match registry.sources[0].page_source(Path::new("/work"), &fetcher) {
            PageSource::Fixture {
                listing_paths,
                detail_dir,
            } => {
                assert_eq!(listing_paths, vec![PathBuf::from("/work/fixtures/linkedin/sample/listing.html")]);
                assert_eq!(detail_dir, Some(PathBuf::from("/work/fixtures/linkedin/sample/details")));
            }
            other => panic!("unexpected page source {other:?}"),
        }
    }

    fn pipeline(root: &Path, store: Arc<InMemoryGateway>) -> SyncPipeline {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.workspace_root = root.to_path_buf();
        SyncPipeline::with_components(config, store, Arc::new(MockEmbedder::default())).unwrap()
    }

    #[tokio::test]
    async fn unknown_source_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let registry: SourceRegistry = serde_yaml::from_str(
            "sources:\n  - source_id: indeed\n    display_name: Indeed\n    listing_urls: [\"https://example.com\"]\n",
        )
        .unwrap();
        let err = pipeline(tmp.path(), Arc::new(InMemoryGateway::new()))
            .build_scrapers(&registry)
            .err()
            .unwrap();
        assert!(err.to_string().contains("indeed"));
    }

    #[tokio::test]
    async fn run_once_from_fixture_registry_writes_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let page = tmp.path().join("page.html");
        std::fs::write(
            &page,
            r#"<div class="base-card" data-entity-urn="urn:li:jobPosting:555">
                 <h3 class="base-search-card__title">Backend Engineer</h3>
                 <h4 class="base-search-card__subtitle">Acme</h4>
                 <span class="job-search-card__location">Remote</span>
               </div>"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("sources.yaml"),
            "sources:\n  - source_id: linkedin\n    display_name: LinkedIn\n    mode: fixture\n    fixture_paths: [page.html]\n",
        )
        .unwrap();

        let store = Arc::new(InMemoryGateway::new());
        let pipeline = pipeline(tmp.path(), store.clone());
        let summary = pipeline.run_once(Arc::new(AtomicBool::new(false))).await.unwrap();
        assert!(summary.report.all_succeeded());
        assert_eq!(summary.report.total_inserted(), 1);
        assert_eq!(summary.report.store_totals.get("linkedin"), Some(&1));
        assert!(summary.reports_dir.join("run_summary.json").exists());
        assert!(summary.reports_dir.starts_with(tmp.path().join("reports")));
        assert_eq!(store.ids().await, vec![555]);
    }

    #[tokio::test]
    async fn scheduler_accepts_configured_cron() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(tmp.path(), Arc::new(InMemoryGateway::new())));
        assert!(pipeline
            .build_scheduler(Arc::new(AtomicBool::new(false)))
            .await
            .is_ok());
    }
}
