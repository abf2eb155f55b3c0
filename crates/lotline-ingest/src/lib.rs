//! Batch orchestration for the reconciliation engine: configuration, the
//! source registry, per-run reports, and optional cron scheduling around the
//! ingestion pipeline and change tracker.

pub mod pipeline;
pub mod tracker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lotline_core::ListingDraft;
use lotline_storage::{ListingStore, MemoryStore, SnapshotArchive};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use pipeline::{IngestError, IngestPipeline, IngestSummary};
pub use tracker::{ChangeTracker, TrackerSummary, STALENESS_DAYS};

pub const CRATE_NAME: &str = "lotline-ingest";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    pub display_name: String,
    pub enabled: bool,
    /// Path (relative to the workspace root) of the batch file the fetch
    /// layer drops for this source.
    #[serde(default)]
    pub batch_file: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    fn batch_path(&self, workspace_root: &PathBuf) -> PathBuf {
        match &self.batch_file {
            Some(rel) => workspace_root.join(rel),
            None => workspace_root.join("batches").join(format!("{}.json", self.source)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub workspace_root: PathBuf,
    pub snapshots_dir: PathBuf,
    pub worker_count: usize,
    pub staleness_days: i64,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("LOTLINE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            snapshots_dir: std::env::var("LOTLINE_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            worker_count: std::env::var("LOTLINE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            staleness_days: std::env::var("LOTLINE_STALENESS_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(STALENESS_DAYS),
            scheduler_enabled: std::env::var("LOTLINE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("LOTLINE_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub ingest: Vec<IngestSummary>,
    pub tracker: TrackerSummary,
    pub reports_dir: String,
}

pub async fn load_source_registry(config: &IngestConfig) -> Result<SourceRegistry> {
    let path = config.workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_draft_batch(path: &PathBuf) -> Result<Vec<ListingDraft>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One full engine run: ingest every enabled source's batch, then run the
/// change-tracking pass, then write the run reports.
pub async fn run_once(
    config: &IngestConfig,
    store: Arc<dyn ListingStore>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let registry = load_source_registry(config).await?;
    let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();

    let archive = SnapshotArchive::new(config.snapshots_dir.clone());
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store),
        archive,
        config.worker_count,
    ));

    let mut ingest = Vec::with_capacity(enabled.len());
    for source in &enabled {
        let span = info_span!("ingest_source", %run_id, source = %source.source);
        let summary = async {
            let path = source.batch_path(&config.workspace_root);
            match load_draft_batch(&path).await {
                Ok(drafts) => {
                    pipeline
                        .run_batch(run_id, &source.source, drafts, Utc::now())
                        .await
                }
                // A source being unreachable yields zero drafts and leaves
                // stored rows untouched; the staleness rule will catch up.
                Err(err) => {
                    warn!(source = %source.source, error = %format!("{err:#}"), "batch unavailable");
                    Ok(IngestSummary::batch_failure(
                        run_id,
                        &source.source,
                        Utc::now(),
                        format!("{err:#}"),
                    ))
                }
            }
        }
        .instrument(span)
        .await?;
        ingest.push(summary);
    }

    let tracker = ChangeTracker::with_staleness(
        Arc::clone(&store),
        chrono::Duration::days(config.staleness_days),
    );
    let tracker_summary = tracker.run(Utc::now()).await?;

    let finished_at = Utc::now();
    let mut summary = RunSummary {
        run_id,
        started_at,
        finished_at,
        enabled_sources: enabled.len(),
        ingest,
        tracker: tracker_summary,
        reports_dir: String::new(),
    };
    let reports_dir = write_reports(config, &summary).await?;
    summary.reports_dir = reports_dir.display().to_string();
    Ok(summary)
}

/// Convenience entry point for the CLI: env config plus the reference
/// in-memory store.
pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = IngestConfig::from_env();
    let store: Arc<dyn ListingStore> = Arc::new(MemoryStore::new());
    run_once(&config, store).await
}

async fn write_reports(config: &IngestConfig, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = config
        .workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let ingested: usize = summary.ingest.iter().map(|s| s.received).sum();
    let errors: usize = summary.ingest.iter().map(|s| s.errors.len()).sum();
    let brief = format!(
        "# Lotline Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Enabled sources: {}\n- Records ingested: {}\n- Record errors: {}\n- Canonical fields updated: {}\n- Possibly-leased flags raised: {}\n\n## Sources\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.enabled_sources,
        ingested,
        errors,
        summary.tracker.fields_updated,
        summary.tracker.stale_flagged,
        summary
            .ingest
            .iter()
            .map(|s| match &s.batch_error {
                Some(err) => format!("- {}: batch unavailable ({err})", s.source),
                None => format!(
                    "- {}: {} received, {} inserted, {} updated, {} dismissed",
                    s.source, s.received, s.inserted, s.updated, s.dismissed
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(reports_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;

    Ok(reports_dir)
}

/// Render the most recent run reports as one markdown digest.
pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Lotline Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let ingested: u64 = value
            .get("ingest")
            .and_then(|v| v.as_array())
            .map(|sources| {
                sources
                    .iter()
                    .filter_map(|s| s.get("received").and_then(|r| r.as_u64()))
                    .sum()
            })
            .unwrap_or(0);
        let flagged = value
            .pointer("/tracker/stale_flagged")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- records ingested: {ingested}"));
        lines.push(format!("- possibly-leased flags: {flagged}"));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

/// Build the cron scheduler when enabled. Scheduled jobs only log a
/// reminder; the operator-facing entry point stays the CLI so runs remain
/// single-flight.
pub async fn maybe_build_scheduler(config: &IngestConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.ingest_cron.as_str(), |_uuid, _l| {
        Box::pin(async move {
            warn!("scheduled ingest tick; invoke `lotline-cli run` to execute a batch");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.ingest_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
