//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use oppscout_core::{
    OpenRouterScorer, Pipeline, PipelineConfig, PipelineOutput, ScoringCapability, any_failed,
    run_diagnostics,
};
use oppscout_shared::{
    AppConfig, LogEntry, ProgressLog, RunnerConfig, expand_home, init_config, load_config,
    load_config_from,
};
use oppscout_sources::{CapabilityRegistry, SourceRegistry};
use oppscout_storage::DedupStore;
use serde::Serialize;
use tracing::info;

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// oppscout: find funding opportunities worth pursuing.
#[derive(Parser)]
#[command(
    name = "oppscout",
    version,
    about = "Aggregate, deduplicate and AI-score funding and contract opportunities.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.oppscout/oppscout.toml).
    #[arg(long, global = true, env = "OPPSCOUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline once.
    Run {
        /// Sources file (overrides `pipeline.sources_file`).
        #[arg(long)]
        sources: Option<String>,

        /// Capability profile (overrides `pipeline.knowledge_file`).
        #[arg(long)]
        knowledge: Option<String>,

        /// Dedup database (overrides `pipeline.database_path`).
        #[arg(long)]
        db: Option<String>,

        /// Limit partnership dossiers and scored candidates.
        #[arg(long)]
        testing: bool,

        /// Write the JSON report here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Check configuration, storage, knowledge, sources, and the scoring service.
    Diagnose,

    /// Delete dedup entries first seen more than N days ago.
    Cleanup {
        /// Retention horizon in days (defaults to `pipeline.retention_days`).
        #[arg(long)]
        days: Option<u32>,
    },

    /// List configured sources and why any were rejected.
    Sources,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr; stdout carries the report.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "oppscout=info",
        1 => "oppscout=debug",
        _ => "oppscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            sources,
            knowledge,
            db,
            testing,
            out,
        } => {
            let mut config = resolve_config(config_path.as_deref())?;
            let p = &mut config.pipeline;
            if let Some(sources) = sources {
                p.sources_file = sources;
            }
            if let Some(knowledge) = knowledge {
                p.knowledge_file = knowledge;
            }
            if let Some(db) = db {
                p.database_path = db;
            }
            p.testing_mode |= testing;
            cmd_run(&config, out.as_deref()).await
        }
        Command::Diagnose => cmd_diagnose(&resolve_config(config_path.as_deref())?).await,
        Command::Cleanup { days } => {
            cmd_cleanup(&resolve_config(config_path.as_deref())?, days).await
        }
        Command::Sources => cmd_sources(&resolve_config(config_path.as_deref())?),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// What `run` writes: the pipeline output plus the full progress log.
#[derive(Serialize)]
struct RunReport<'a> {
    #[serde(flatten)]
    output: &'a PipelineOutput,
    log: Vec<LogEntry>,
}

async fn cmd_run(config: &AppConfig, out: Option<&Path>) -> Result<()> {
    // Fail before any scraping when the key is missing.
    let scorer: Arc<dyn ScoringCapability> = Arc::new(OpenRouterScorer::from_config(config)?);
    let capabilities = CapabilityRegistry::builtin()?;
    let pipeline = Pipeline::new(PipelineConfig::from(config), capabilities, scorer);

    info!(
        sources = %pipeline.config().sources_file.display(),
        testing = config.pipeline.testing_mode,
        "starting run"
    );

    let progress = Arc::new(CliProgress::new());
    let log = ProgressLog::with_sink(progress.clone());
    let result = pipeline.run(&log).await;
    progress.finish();
    let output = result?;

    let report = RunReport {
        output: &output,
        log: log.entries(),
    };
    let json = serde_json::to_string_pretty(&report)?;

    let stats = &output.stats;
    eprintln!();
    eprintln!("  Run {} finished in {:.1}s", output.run_id, stats.elapsed_seconds);
    eprintln!("  Candidates: {} ({} scored)", stats.candidates, stats.scored);
    eprintln!(
        "  Relevant:   {} ({} new, {} dropped)",
        stats.relevant, stats.new_records, stats.dropped
    );
    eprintln!("  Partners:   {}", output.partnership.len());
    eprintln!("  Matches:    {}", output.matchmaking.len());
    if !output.failed_sources.is_empty() {
        eprintln!("  Failed:     {}", output.failed_sources.join(", "));
    }
    eprintln!();

    match out {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| eyre!("cannot write report to {}: {e}", path.display()))?;
            eprintln!("  Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// diagnose / cleanup / sources / config
// ---------------------------------------------------------------------------

async fn cmd_diagnose(config: &AppConfig) -> Result<()> {
    let capabilities = CapabilityRegistry::builtin()?;
    let scorer = OpenRouterScorer::from_config(config)
        .ok()
        .map(|s| Arc::new(s) as Arc<dyn ScoringCapability>);

    let checks = run_diagnostics(config, &capabilities, scorer).await;

    println!();
    for check in &checks {
        println!("  {:<5} {:<14} {}", check.status, check.name, check.detail);
    }
    println!();

    if any_failed(&checks) {
        let failed = checks
            .iter()
            .filter(|c| c.status == oppscout_core::CheckStatus::Fail)
            .count();
        return Err(eyre!("{failed} diagnostic check(s) failed"));
    }
    Ok(())
}

async fn cmd_cleanup(config: &AppConfig, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.pipeline.retention_days);
    let path = expand_home(&config.pipeline.database_path);
    let store = DedupStore::open(&path).await?;
    let deleted = store.cleanup(days).await?;
    let remaining = store.count().await?;
    println!("Removed {deleted} entries older than {days} days ({remaining} remain)");
    Ok(())
}

fn cmd_sources(config: &AppConfig) -> Result<()> {
    let capabilities = CapabilityRegistry::builtin()?;
    let path = expand_home(&config.pipeline.sources_file);
    let registry = SourceRegistry::load_config(
        &path,
        &capabilities,
        &RunnerConfig::from(config),
        &ProgressLog::new(),
    )?;

    println!();
    println!("  Sources from {}", path.display());
    for desc in registry.descriptors() {
        let params: Vec<&str> = desc.params.keys().map(String::as_str).collect();
        println!(
            "  {} {:<28} {:<18} [{}]",
            if desc.enabled { "+" } else { "-" },
            desc.name,
            desc.capability.id(),
            params.join(", ")
        );
    }
    for invalid in registry.invalid() {
        println!("  ! {:<28} {}", invalid.name, invalid.reason);
    }
    println!();
    println!("  Known capabilities: {}", capabilities.ids().join(", "));
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
