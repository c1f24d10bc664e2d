use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sdh_sync::{HarvestConfig, HarvestError, HarvestSettings};
use secrecy::SecretString;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sdh-cli")]
#[command(about = "Incremental ServiceDesk ticket harvester")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    harvest: HarvestArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch newly resolved tickets and merge them into the checkpoint (default).
    Harvest(HarvestArgs),
    /// Summarize the checkpoint file.
    Inspect {
        #[arg(short = 'c', long)]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct HarvestArgs {
    /// ServiceDesk session token (SDPSESSIONID cookie value).
    #[arg(short = 't', long)]
    token: Option<String>,
    /// ServiceDesk base URL, e.g. https://helpdesk.example.com
    #[arg(short = 'u', long)]
    url: Option<String>,
    #[arg(short = 'c', long)]
    checkpoint: Option<PathBuf>,
    /// YAML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    discovery_workers: Option<usize>,
    #[arg(long)]
    fetch_workers: Option<usize>,
    #[arg(long)]
    page_size: Option<u32>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn build_config(args: HarvestArgs) -> Result<HarvestConfig, HarvestError> {
    let mut config = HarvestConfig::from_env();
    if let Some(path) = &args.config {
        config.apply_settings(HarvestSettings::from_yaml_file(path).await?);
    }
    if let Some(token) = args.token {
        config.session_token = Some(SecretString::from(token));
    }
    if let Some(url) = args.url {
        config.base_url = url;
    }
    if let Some(path) = args.checkpoint {
        config.checkpoint_path = path;
    }
    if let Some(n) = args.discovery_workers {
        config.discovery_workers = n;
    }
    if let Some(n) = args.fetch_workers {
        config.fetch_workers = n;
    }
    if let Some(n) = args.page_size {
        config.page_size = n;
    }
    Ok(config)
}

async fn harvest(args: HarvestArgs) -> Result<(), HarvestError> {
    let config = build_config(args).await?;
    let summary = sdh_sync::run_harvest(config).await?;
    if !summary.failed_ids.is_empty() {
        warn!(ids = ?summary.failed_ids, "some tickets could not be fetched this run");
    }
    println!(
        "harvest complete: run_id={} discovered={} fetched={} unresolved={} failed={} entries={} path={}",
        summary.run_id,
        summary.discovered,
        summary.fetched,
        summary.unresolved,
        summary.failed_ids.len(),
        summary.persisted_entries,
        summary.snapshot_path
    );
    Ok(())
}

async fn inspect(checkpoint: Option<PathBuf>) -> Result<()> {
    let path = checkpoint.unwrap_or_else(|| HarvestConfig::from_env().checkpoint_path);
    let overview = sdh_sync::inspect_checkpoint(&path).await?;
    let first = overview.first_id.map(|id| id.to_string());
    let last = overview.last_id.map(|id| id.to_string());
    println!(
        "checkpoint {}: status={} entries={} first={} last={}",
        overview.path,
        overview.status,
        overview.entries,
        first.as_deref().unwrap_or("-"),
        last.as_deref().unwrap_or("-")
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Inspect { checkpoint }) => {
            inspect(checkpoint).await.map_err(HarvestError::Storage)
        }
        Some(Commands::Harvest(args)) => harvest(args).await,
        None => harvest(cli.harvest).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(err.exit_code())
        }
    }
}
