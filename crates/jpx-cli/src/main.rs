use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jpx_storage::AnyStore;
use jpx_sync::config::parse_as_of;
use jpx_sync::{
    write_run_report, CollectionsConfig, Pipeline, PipelineConfig, RunFailure, RunMode, RunSummary,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jpx")]
#[command(about = "Canonicalize job posting attributes and rebuild lookup tables, flat view and indexes")]
struct Cli {
    /// Source store url (`postgres://…`, `memory:`, or a directory).
    #[arg(long, global = true)]
    store: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild lookup tables, the flat view and every index.
    Normalize(RunArgs),
    /// Rebuild the indexes only.
    Index(RunArgs),
    /// Apply the Postgres schema.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Destination store url; defaults to the source store.
    #[arg(long)]
    sink_store: Option<String>,
    /// Collection layout file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    source_collection: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    /// Run clock as RFC 3339; pins every derived timestamp.
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    no_report: bool,
    /// Read the whole source document instead of the used fields.
    #[arg(long)]
    full_scan: bool,
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
    /// Aggregate without writing any destination.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Commands::Normalize(RunArgs::default())) {
        Commands::Normalize(args) => run_pipeline(cli.store, RunMode::Normalize, args).await,
        Commands::Index(args) => run_pipeline(cli.store, RunMode::IndexOnly, args).await,
        Commands::Migrate => {
            let url = match cli.store {
                Some(url) => url,
                None => PipelineConfig::from_env()?.store_url,
            };
            match AnyStore::open(&url).await? {
                AnyStore::Postgres(store) => {
                    store.migrate().await.context("applying migrations")?;
                    println!("migrations applied");
                    Ok(ExitCode::SUCCESS)
                }
                other => bail!("migrate needs a postgres store, got a {} store", other.kind()),
            }
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr)))
        .init();
}

fn build_config(store: Option<String>, mode: RunMode, args: &RunArgs) -> Result<PipelineConfig> {
    apply_overrides(PipelineConfig::from_env()?, store, mode, args)
}

/// Layers command-line flags over the env/YAML config.
fn apply_overrides(
    mut config: PipelineConfig,
    store: Option<String>,
    mode: RunMode,
    args: &RunArgs,
) -> Result<PipelineConfig> {
    if let Some(path) = &args.config {
        config.collections = CollectionsConfig::load(path)?;
    }
    if let Some(url) = store {
        config.store_url = url;
    }
    if let Some(source) = &args.source_collection {
        config.source_collection = source.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(raw) = &args.as_of {
        config.as_of = parse_as_of(raw)?;
    }
    if let Some(dir) = &args.reports_dir {
        config.reports_dir = dir.clone();
    }
    config.mode = mode;
    config.dry_run = args.dry_run;
    config.use_projection = !args.full_scan;

    let config = config.normalized();
    config.validate()?;
    Ok(config)
}

async fn run_pipeline(store: Option<String>, mode: RunMode, args: RunArgs) -> Result<ExitCode> {
    let config = build_config(store, mode, &args)?;

    if !args.yes && !config.dry_run && !confirm(&config)? {
        println!("aborted, nothing written");
        return Ok(ExitCode::SUCCESS);
    }

    let source = AnyStore::open(&config.store_url)
        .await
        .with_context(|| format!("opening source store {}", config.store_url))?;
    let sink = match &args.sink_store {
        Some(url) => AnyStore::open(url)
            .await
            .with_context(|| format!("opening sink store {url}"))?,
        None => source.clone(),
    };
    info!(source = source.kind(), sink = sink.kind(), "stores opened");

    let reports_dir = config.reports_dir.clone();
    let pipeline = Pipeline::new(config, Arc::new(source), Arc::new(sink))?;

    let (summary, succeeded) = settle(pipeline.run().await);

    print_summary(&summary);
    if !args.no_report {
        let run_dir = write_run_report(&reports_dir, &summary).await?;
        println!("report: {}", run_dir.display());
    }
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The summary to report, and whether the run completed.
fn settle(result: Result<RunSummary, RunFailure>) -> (RunSummary, bool) {
    match result {
        Ok(summary) => (summary, true),
        Err(RunFailure {
            stage,
            summary,
            source,
        }) => {
            error!(%stage, error = %source, "run failed");
            eprintln!("error: run aborted while {stage}: {source}");
            (*summary, false)
        }
    }
}

fn confirm(config: &PipelineConfig) -> Result<bool> {
    let collections = &config.collections;
    let destinations = match config.mode {
        RunMode::Normalize => collections.lookup_tables.len() + 1 + collections.indexes.len(),
        RunMode::IndexOnly => collections.indexes.len(),
    };
    print!(
        "Rebuild {destinations} destination collection(s) from `{}` in {}? [y/N] ",
        config.source_collection, config.store_url
    );
    io::stdout().flush().context("flushing prompt")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} {}: pages={} scanned={} processed={} skipped={} failed={} written={} (flat={} index={} lookup={}) staged={}{}",
        summary.run_id,
        summary.state,
        summary.pages,
        summary.scanned,
        summary.processed,
        summary.skipped,
        summary.failed,
        summary.written.total(),
        summary.written.flat_view,
        summary.written.index,
        summary.written.lookup,
        summary.rows_staged,
        if summary.dry_run { " [dry run]" } else { "" },
    );
    for (category, count) in &summary.unique_terms {
        println!("  unique {category}: {count}");
    }
}
