use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::orchestrator::{RunReport, SourceStatus};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

pub fn render_daily_brief(report: &RunReport) -> String {
    let mut lines = vec![
        "# Job Sync Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at.to_rfc3339()),
        format!("- Finished: {}", report.finished_at.to_rfc3339()),
        format!("- Embedder: {}", report.embedder),
        format!(
            "- Sources: {} succeeded, {} failed, {} cancelled",
            report.succeeded(),
            report.failed(),
            report.cancelled()
        ),
        format!("- New jobs: {}", report.total_inserted()),
        format!("- Expired: {}", report.sweep.deleted_expired),
        format!("- Duplicates collapsed: {}", report.sweep.deleted_duplicates),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &report.sources {
        let status = match source.status {
            SourceStatus::Succeeded => "ok",
            SourceStatus::Failed => "FAILED",
            SourceStatus::Cancelled => "cancelled",
        };
        let mut line = format!(
            "- {} [{}]: scraped {}, inserted {}, duplicates {}, malformed {}, embedding failures {}",
            source.source_id,
            status,
            source.scraped,
            source.inserted,
            source.skipped_duplicate,
            source.malformed,
            source.embedding_failures
        );
        if let Some(err) = &source.error {
            line.push_str(&format!(" ({err})"));
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.push("## Store Totals".to_string());
    if report.store_totals.is_empty() {
        lines.push("- (empty)".to_string());
    }
    for (source, count) in &report.store_totals {
        lines.push(format!("- {source}: {count}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `reports/<run_id>/{run_summary.json,daily_brief.md}` and returns the directory.
pub async fn write_run_reports(workspace_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), summary)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join(DAILY_BRIEF_FILE), render_daily_brief(report))
        .await
        .context("writing daily_brief.md")?;
    Ok(reports_dir)
}

/// Markdown digest of the `runs` most recent run summaries, newest first.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry?;
        let path = entry.path().join(RUN_SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: RunReport = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((report, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Job Sync Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (report, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- started: {}", report.started_at.to_rfc3339()));
        lines.push(format!(
            "- sources: {} ok / {} failed / {} cancelled",
            report.succeeded(),
            report.failed(),
            report.cancelled()
        ));
        lines.push(format!("- inserted: {}", report.total_inserted()));
        lines.push(format!(
            "- expired: {}, duplicates collapsed: {}",
            report.sweep.deleted_expired, report.sweep.deleted_duplicates
        ));
        let stored: usize = report.store_totals.values().sum();
        lines.push(format!("- stored after run: {stored}"));
        let brief = dir.join(DAILY_BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
