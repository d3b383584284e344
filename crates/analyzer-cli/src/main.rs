// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

mod mock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use analyzer_api::JobSnapshot;
use analyzer_cache::AnalysisCache;
use analyzer_config::{load_config, validate_config, AnalyzerConfig};
use analyzer_core::{JobBuilder, JobOptions, Source};
use analyzer_eventlog::EventLog;
use analyzer_planner::{plan, Plan};
use analyzer_resolver::{resolve, ResolveOutcome};
use analyzer_rules::rules_for;
use analyzer_scheduler::{CancellationToken, Deps, ResourceFetcher};
use analyzer_store::{ArtifactStore, JobStore};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use mock::{DemoLlmCaller, DemoResourceFetcher, DemoSearchAdapter};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "analyzer", version, about = "Profile analysis pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Path to a TOML configuration file overlaying the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan and run a job against a source, printing the final snapshot.
    Analyze {
        /// Upstream source to analyze.
        #[arg(value_enum)]
        source: SourceArg,

        /// Raw input content (handle, URL, opaque id, or free text).
        input: String,

        /// Explicit card selection; omit for the source's default visible set.
        #[arg(long = "card")]
        cards: Vec<String>,

        /// Route input through the freeform resolver even if it looks
        /// unambiguous.
        #[arg(long)]
        freeform: bool,

        /// Bypass cache reads for every unit in this job.
        #[arg(long)]
        force_refresh: bool,

        /// Skip confirmation and use the resolver's best candidate as-is.
        #[arg(long)]
        allow_ambiguous: bool,

        /// Write the final job snapshot as JSON to this file, in addition
        /// to printing it.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Inspect a job snapshot previously written by `analyze --out`.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Print the static card DAG declared for a source.
    Rules {
        /// Upstream source whose rule set to print.
        #[arg(value_enum)]
        source: SourceArg,
    },
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    /// Pretty-print a previously saved job snapshot file.
    Show {
        /// Path to a JSON file written by `analyze --out`.
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Scholar,
    Github,
    Linkedin,
    Twitter,
    Openreview,
    Huggingface,
    Youtube,
}

impl From<SourceArg> for Source {
    fn from(v: SourceArg) -> Self {
        match v {
            SourceArg::Scholar => Source::Scholar,
            SourceArg::Github => Source::Github,
            SourceArg::Linkedin => Source::Linkedin,
            SourceArg::Twitter => Source::Twitter,
            SourceArg::Openreview => Source::Openreview,
            SourceArg::Huggingface => Source::Huggingface,
            SourceArg::Youtube => Source::Youtube,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("analyzer=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("analyzer=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config.clone();
    let result = match cli.command {
        Commands::Analyze { source, input, cards, freeform, force_refresh, allow_ambiguous, out } => {
            cmd_analyze(config.as_deref(), source.into(), &input, cards, freeform, force_refresh, allow_ambiguous, out)
                .await
        }
        Commands::Jobs { action } => match action {
            JobsAction::Show { file } => cmd_jobs_show(&file),
        },
        Commands::Rules { source } => cmd_rules(source.into()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_analyze(
    config_path: Option<&std::path::Path>,
    source: Source,
    input: &str,
    cards: Vec<String>,
    freeform: bool,
    force_refresh: bool,
    allow_ambiguous: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path).context("loading configuration")?;
    for warning in validate_config(&config).context("validating configuration")? {
        tracing::warn!(%warning, "configuration warning");
    }
    let config = Arc::new(config);

    let rules = rules_for(source);
    let cache = Arc::new(AnalysisCache::new(
        chrono::Duration::milliseconds(config.cache_card_output_ttl.fresh_ms as i64),
        chrono::Duration::milliseconds(config.cache_card_output_ttl.stale_ms as i64),
    ));

    let now = Utc::now();
    let search_adapter = DemoSearchAdapter;
    let outcome = resolve(source, input, freeform, &search_adapter, &cache, now)
        .await
        .context("resolving input")?;

    let subject_key = match outcome {
        ResolveOutcome::Resolved { subject_key } => subject_key,
        ResolveOutcome::NeedsConfirmation { candidates } => {
            if allow_ambiguous {
                candidates
                    .into_iter()
                    .next()
                    .map(|c| c.subject_key)
                    .context("resolver returned no candidates")?
            } else {
                println!("needs confirmation, candidates:");
                for candidate in &candidates {
                    println!("  {} (score {:.2}) -> {}", candidate.label, candidate.score, candidate.subject_key);
                }
                return Ok(());
            }
        }
    };

    let requested = if cards.is_empty() { None } else { Some(cards.as_slice()) };
    let planned: Plan = plan(rules, requested).context("planning job")?;

    let options = JobOptions { freeform, force_refresh, allow_ambiguous };
    let job = JobBuilder::new(source, subject_key).options(options).build(now);
    let job_id = job.id;

    let mut resource_fetchers: HashMap<String, Arc<dyn ResourceFetcher>> = HashMap::new();
    for unit in &planned.units {
        resource_fetchers
            .entry(unit.concurrency_group.clone())
            .or_insert_with(|| Arc::new(DemoResourceFetcher::new(unit.concurrency_group.clone())));
    }

    let deps = Deps {
        job_store: Arc::new(JobStore::new()),
        artifact_store: Arc::new(ArtifactStore::new()),
        event_log: Arc::new(EventLog::new()),
        cache,
        config,
        resource_fetchers: Arc::new(resource_fetchers),
        llm_caller: Arc::new(DemoLlmCaller),
    };

    let cancel = CancellationToken::new();
    let finished = analyzer_scheduler::run_job(&deps, job, planned.clone(), cancel).await;

    let cards = planned
        .units
        .iter()
        .filter_map(|unit| deps.job_store.get_card(job_id, &unit.name))
        .map(|card| analyzer_api::CardSnapshot {
            card: card.card_name,
            status: card.status,
            internal: card.internal,
            stream_spec: card.stream_spec,
            output: card.output,
        })
        .collect();
    let snapshot = JobSnapshot { job: finished, cards };

    let rendered = serde_json::to_string_pretty(&snapshot).context("serializing job snapshot")?;
    println!("{rendered}");
    if let Some(path) = out {
        std::fs::write(&path, &rendered).with_context(|| format!("writing snapshot to {}", path.display()))?;
    }

    Ok(())
}

fn cmd_jobs_show(file: &std::path::Path) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let snapshot: JobSnapshot = serde_json::from_str(&raw).context("parsing job snapshot")?;
    println!("job {} ({:?})", snapshot.job.id, snapshot.job.status);
    for card in &snapshot.cards {
        println!("  {:<24} {:?}", card.card, card.status);
    }
    Ok(())
}

fn cmd_rules(source: Source) -> Result<()> {
    let rules = rules_for(source);
    let planned = plan(rules, None).context("planning default visible cards")?;
    println!("source: {source}");
    println!("aggregator: {}", rules.aggregator_name());
    for unit in &planned.units {
        let deps = if unit.depends_on.is_empty() {
            "-".to_string()
        } else {
            unit.depends_on.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        println!(
            "  {:<24} kind={:?} group={:<12} deadline_ms={:<7} depends_on=[{}]",
            unit.name,
            unit.kind,
            unit.concurrency_group,
            unit.deadline_ms.map_or("-".to_string(), |ms| ms.to_string()),
            deps
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_arg_maps_to_every_core_source() {
        assert_eq!(Source::from(SourceArg::Scholar), Source::Scholar);
        assert_eq!(Source::from(SourceArg::Github), Source::Github);
        assert_eq!(Source::from(SourceArg::Youtube), Source::Youtube);
    }

    #[test]
    fn cli_parses_analyze_with_repeated_cards() {
        let cli = Cli::parse_from([
            "analyzer",
            "analyze",
            "github",
            "torvalds",
            "--card",
            "resource.profile",
            "--card",
            "profile",
        ]);
        match cli.command {
            Commands::Analyze { cards, .. } => {
                assert_eq!(cards, vec!["resource.profile".to_string(), "profile".to_string()]);
            }
            _ => panic!("expected Analyze"),
        }
    }
}
