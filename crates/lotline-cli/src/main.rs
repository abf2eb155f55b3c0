use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lotline_core::EntityKind;
use lotline_match::{Candidate, CandidateIndex, Thresholds};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lotline-cli")]
#[command(about = "Lotline record reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every enabled source's batch, run change tracking, write reports.
    Run,
    /// Match a query string against a candidate file.
    Match {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// JSON array of candidate strings, or of objects with id and text.
        #[arg(long)]
        candidates: PathBuf,
        /// Score against the assessment-roll threshold row.
        #[arg(long)]
        assessment: bool,
        query: String,
    },
    /// Print a markdown digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Start the cron scheduler and wait for Ctrl-C.
    Schedule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Company,
    Person,
    Address,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Company => EntityKind::Company,
            KindArg::Person => EntityKind::Person,
            KindArg::Address => EntityKind::Address,
        }
    }
}

fn load_candidates(path: &PathBuf) -> Result<Vec<Candidate>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(text) => Ok(Candidate {
                id: Uuid::new_v4(),
                text,
            }),
            serde_json::Value::Object(map) => {
                let text = map
                    .get("text")
                    .and_then(|v| v.as_str())
                    .context("candidate object is missing a text field")?
                    .to_string();
                let id = match map.get("id").and_then(|v| v.as_str()) {
                    Some(raw) => raw.parse().context("candidate id is not a UUID")?,
                    None => Uuid::new_v4(),
                };
                Ok(Candidate { id, text })
            }
            other => anyhow::bail!("candidate entries must be strings or objects, got {other}"),
        })
        .collect()
}

fn run_match(kind: EntityKind, candidates: &PathBuf, assessment: bool, query: &str) -> Result<()> {
    let candidates = load_candidates(candidates)?;
    let thresholds = if assessment {
        Thresholds::ASSESSMENT_ADDRESS
    } else {
        Thresholds::for_kind(kind)
    };
    let index = CandidateIndex::build(kind, thresholds, &candidates);
    let matches = index.find(query);
    if matches.is_empty() {
        println!("no match for {query:?}");
        return Ok(());
    }
    for m in matches {
        println!(
            "{:.3}  {:?}  {}  {}",
            m.score, m.tier, m.candidate_id, m.matched
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = lotline_ingest::run_once_from_env().await?;
            println!(
                "run complete: run_id={} sources={} fields_updated={} stale_flagged={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.tracker.fields_updated,
                summary.tracker.stale_flagged,
                summary.reports_dir
            );
        }
        Commands::Match {
            kind,
            candidates,
            assessment,
            query,
        } => {
            run_match(kind.into(), &candidates, assessment, &query)?;
        }
        Commands::Report { runs } => {
            let digest = lotline_ingest::report_markdown(runs, None)?;
            println!("{digest}");
        }
        Commands::Schedule => {
            let config = lotline_ingest::IngestConfig::from_env();
            match lotline_ingest::maybe_build_scheduler(&config).await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    println!("scheduler running on cron {:?}; Ctrl-C to stop", config.ingest_cron);
                    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                }
                None => {
                    eprintln!("scheduler disabled; set LOTLINE_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
