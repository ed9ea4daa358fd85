use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rpt_core::{FetchStatus, RunReport};
use rpt_sync::{PipelineConfig, RunMode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rpt-cli")]
#[command(about = "Snapshot the report export and rebuild the reporting tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the run report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Run against in-memory stores; no database is touched.
    #[arg(long, global = true)]
    in_memory: bool,

    /// Overrides RPT_SOURCE_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Overrides RPT_ENTITY_REGISTRY.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every entity type, then transform the latest snapshots.
    Run,
    /// Fetch and snapshot only.
    Fetch,
    /// Transform the latest stored snapshots only.
    Transform,
    /// Create the snapshot table and every registered table.
    InitSchema,
    /// List registered entity types and their tables.
    Entities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?,
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serializing run report")?
        );
        return Ok(());
    }

    println!("run {}: {}", report.run_id, report.headline());
    if let Some(source) = &report.source {
        println!("  source   {source}");
    }
    for fetch in &report.fetches {
        match &fetch.status {
            FetchStatus::Captured { records, snapshot_id, .. } => println!(
                "  fetched  {:<16} {records} records (snapshot {snapshot_id})",
                fetch.entity_type
            ),
            FetchStatus::Failed { error } => {
                println!("  FAILED   {:<16} {error}", fetch.entity_type)
            }
        }
    }
    for load in &report.loads {
        println!(
            "  loaded   {:<16} {} rows into {} ({}; {} kept)",
            load.entity_type, load.rows_loaded, load.table, load.strategy, load.rows_skipped
        );
    }
    for entity_type in &report.skipped {
        println!("  skipped  {entity_type:<16} no mapping registered");
    }
    Ok(())
}

fn print_entities(config: &PipelineConfig) -> Result<()> {
    let registry = rpt_sync::load_registry(config)?;
    for spec in registry.entities() {
        let origin = spec
            .derived_from
            .as_ref()
            .map(|d| format!(" from {} where {} = {}", d.entity_type, d.field, d.equals))
            .unwrap_or_default();
        println!(
            "{:<16} -> {:<16} {:<17} key [{}], {} columns{origin}",
            spec.entity_type,
            spec.table.name,
            spec.strategy.to_string(),
            spec.table.key.join(", "),
            spec.table.columns.len(),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    let mut config = PipelineConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.source_base_url = Some(base_url);
    }
    if let Some(registry) = cli.registry {
        config.registry_path = Some(registry);
    }

    let command = cli.command.unwrap_or(Commands::Run);
    if cli.in_memory && !matches!(command, Commands::Run) {
        bail!("--in-memory only applies to `run`");
    }

    let report = match command {
        Commands::Run if cli.in_memory => rpt_sync::run_in_memory(&config).await?,
        Commands::Run => rpt_sync::run_with_postgres(&config, RunMode::Full).await?,
        Commands::Fetch => rpt_sync::run_with_postgres(&config, RunMode::FetchOnly).await?,
        Commands::Transform => {
            rpt_sync::run_with_postgres(&config, RunMode::TransformOnly).await?
        }
        Commands::InitSchema => {
            let tables = rpt_sync::init_schema(&config).await?;
            println!("schema ready: raw_snapshots + {tables} tables");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Entities => {
            print_entities(&config)?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    print_report(&report, cli.json)?;
    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
