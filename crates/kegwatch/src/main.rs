//! Kegwatch station launcher.
//!
//! One process per camera station: `run` starts the capture/aggregation/
//! sync loop, the remaining subcommands are operator utilities over the
//! station database.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kegwatch_logging::LogConfig;
use kegwatch_protocol::{PalletId, PalletState};
use kegwatch_store::{recover, Store};
use tracing::info;

use kegwatch::config::StationConfig;
use kegwatch::runtime;

#[derive(Parser, Debug)]
#[command(name = "kegwatch", about = "Keg counting camera station")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $KEGWATCH_HOME/kegwatch.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the station loop (capture, aggregate, sync)
    Run,

    /// Run the startup recovery pass and print the report
    Recover,

    /// Show queue and pallet statistics
    Status,

    /// Re-arm a failed delivery for another attempt cycle
    Resync {
        /// Pallet id of the failed delivery
        pallet_id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = kegwatch_logging::init_logging(LogConfig {
        app_name: "kegwatch",
        verbose: cli.verbose,
    }) {
        eprintln!("Failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(StationConfig::default_path);
    let config = StationConfig::load(&config_path)?;

    match cli.command {
        Commands::Run => runtime::run_station(config).await,
        Commands::Recover => run_recover(config).await,
        Commands::Status => run_status(config).await,
        Commands::Resync { pallet_id } => run_resync(config, &pallet_id).await,
    }
}

async fn open_store(config: &StationConfig) -> Result<Store> {
    let store = Store::open(&config.store.database_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open station database: {}",
                config.store.database_path.display()
            )
        })?;
    store.init().await?;
    Ok(store)
}

async fn run_recover(config: StationConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let report = recover(&store, config.failed_retention_ms()).await?;
    println!("Recovery report");
    println!("  in-flight deliveries re-queued: {}", report.reset_in_flight);
    println!("  lost deliveries re-enqueued:    {}", report.requeued);
    println!("  retired failures purged:        {}", report.purged_failed);
    println!("  active pallet records:          {}", report.active_pallets);
    Ok(())
}

async fn run_status(config: StationConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let stats = store.queue_stats().await?;
    println!("Sync queue");
    println!("  pending:   {}", stats.pending);
    println!("  in-flight: {}", stats.in_flight);
    println!("  acked:     {}", stats.acked);
    println!("  failed:    {}", stats.failed);

    let pallets = store.count_pallets_by_state().await?;
    println!("Pallets");
    for state in PalletState::ALL {
        if let Some(count) = pallets.get(&state) {
            println!("  {:<15} {}", state.as_str(), count);
        }
    }
    Ok(())
}

async fn run_resync(config: StationConfig, raw_id: &str) -> Result<()> {
    let pallet_id: PalletId = raw_id
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let store = open_store(&config).await?;
    if store.resync(&pallet_id).await? {
        info!(%pallet_id, "failed delivery re-armed");
        println!("Delivery for {pallet_id} re-armed");
    } else {
        println!("No failed delivery for {pallet_id}");
    }
    Ok(())
}
