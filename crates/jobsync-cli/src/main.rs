use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobsync_sync::{
    init_collection, report_daily_markdown, run_sync_once_from_env, search_jobs, RunReport,
    SearchQuery, SyncConfig, SyncPipeline, DEFAULT_SEARCH_LIMIT,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Job posting ingestion and vector-store maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep the store, then scrape and ingest every enabled source.
    Run,
    /// Create the collection and payload indexes if missing.
    Init,
    /// Run only the expiry and duplicate-collapse sweeps.
    Sweep,
    /// Recompute every stored embedding (after an embedding model change).
    Reembed,
    /// Semantic search over stored jobs.
    Search {
        query: String,
        #[arg(long, value_delimiter = ',')]
        skills: Vec<String>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
        #[arg(long)]
        min_score: Option<f32>,
        #[arg(long)]
        json: bool,
    },
    /// Run once now, then on the configured cron schedule until interrupted.
    Schedule,
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("JOBSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Sets `shutdown` once `interrupt` resolves; the handle completes with it.
fn spawn_interrupt_watcher<F>(shutdown: Arc<AtomicBool>, interrupt: F) -> JoinHandle<()>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match interrupt.await {
            Ok(()) => {
                warn!("interrupt received; stopping after the current source");
                shutdown.store(true, Ordering::SeqCst);
            }
            Err(err) => warn!(error = %err, "interrupt handler unavailable"),
        }
    })
}

/// 0 when every source succeeded, 2 when any failed or was cancelled.
fn exit_status(report: &RunReport) -> u8 {
    if report.all_succeeded() {
        0
    } else {
        2
    }
}

fn print_run(report: &RunReport, reports_dir: &std::path::Path) {
    println!(
        "sync complete: run_id={} succeeded={} failed={} cancelled={} inserted={} expired={} collapsed={} reports={}",
        report.run_id,
        report.succeeded(),
        report.failed(),
        report.cancelled(),
        report.total_inserted(),
        report.sweep.deleted_expired,
        report.sweep.deleted_duplicates,
        reports_dir.display()
    );
    for source in &report.sources {
        println!(
            "  {:<10} {:?} inserted={} duplicates={} malformed={}{}",
            source.source_id,
            source.status,
            source.inserted,
            source.skipped_duplicate,
            source.malformed,
            source
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}

async fn execute(command: Commands) -> Result<u8> {
    match command {
        Commands::Run => {
            let shutdown = Arc::new(AtomicBool::new(false));
            spawn_interrupt_watcher(shutdown.clone(), tokio::signal::ctrl_c());
            let summary = run_sync_once_from_env(shutdown).await?;
            print_run(&summary.report, &summary.reports_dir);
            Ok(exit_status(&summary.report))
        }
        Commands::Init => {
            let config = SyncConfig::from_env();
            if init_collection(&config).await? {
                println!("created collection {}", config.qdrant_collection);
            } else {
                println!("collection {} already exists", config.qdrant_collection);
            }
            Ok(0)
        }
        Commands::Sweep => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let sweep = pipeline
                .engine()
                .sweep_at(Utc::now())
                .await
                .context("running cleanup sweeps")?;
            println!(
                "sweep complete: expired={} collapsed={} undated={}",
                sweep.deleted_expired, sweep.deleted_duplicates, sweep.retained_undated
            );
            Ok(0)
        }
        Commands::Reembed => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let result = pipeline
                .engine()
                .reembed_all()
                .await
                .context("re-embedding stored jobs")?;
            println!(
                "re-embedding complete: reembedded={} failures={}",
                result.reembedded, result.failures
            );
            Ok(if result.failures == 0 { 0 } else { 2 })
        }
        Commands::Search {
            query,
            skills,
            job_type,
            location,
            limit,
            min_score,
            json,
        } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let query = SearchQuery {
                skills,
                job_type,
                location,
                limit,
                score_threshold: min_score,
                ..SearchQuery::new(query)
            };
            let hits = search_jobs(
                pipeline.gateway().as_ref(),
                pipeline.embedder().as_ref(),
                &query,
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in &hits {
                    println!(
                        "{:.3}  {} | {} | {} [{}] {}",
                        hit.score, hit.title, hit.company, hit.location, hit.source, hit.job_url
                    );
                }
            }
            Ok(0)
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);
            let shutdown = Arc::new(AtomicBool::new(false));
            let interrupted = spawn_interrupt_watcher(shutdown.clone(), tokio::signal::ctrl_c());
            match pipeline.run_once(shutdown.clone()).await {
                Ok(summary) => print_run(&summary.report, &summary.reports_dir),
                Err(err) => error!(error = %format!("{err:#}"), "initial sync failed"),
            }
            if shutdown.load(Ordering::SeqCst) {
                info!("interrupted during the initial sync; scheduler not started");
                return Ok(0);
            }
            let mut sched = pipeline.build_scheduler(shutdown.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().scheduler_cron, "scheduler running; ctrl-c to stop");
            interrupted.await.context("waiting for ctrl-c")?;
            shutdown.store(true, Ordering::SeqCst);
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(0)
        }
        Commands::Report {
            runs,
            workspace_root,
        } => {
            let root = workspace_root.unwrap_or_else(|| SyncConfig::from_env().workspace_root);
            println!("{}", report_daily_markdown(runs, Some(root))?);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match execute(cli.command.unwrap_or(Commands::Run)).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "jobsync failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
