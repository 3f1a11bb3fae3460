use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use wallstonks::cache::QuoteCache;
use wallstonks::chart::ChartRenderer;
use wallstonks::error::Result;
use wallstonks::fetch::{AlphaVantageClient, FetchConfig};
use wallstonks::market::ActiveHours;
use wallstonks::publish::{SystemDesktop, WallpaperPublisher};
use wallstonks::scheduler::{run_once, CycleContext, CycleOutcome, RefreshScheduler};
use wallstonks::settings::{self, SettingsStore};

#[derive(Parser)]
#[command(name = "wallstonks")]
#[command(about = "Stock chart wallpaper updater", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Settings file path; defaults to the per-user config directory
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background refresh loop (default)
    Run,

    /// Fetch, render, and publish a single wallpaper, then exit
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(settings::default_config_path);
    let store = Arc::new(SettingsStore::open(&config_path)?);
    info!("Settings loaded from {}", config_path.display());

    let current = store.current();
    if current.symbols.is_empty() {
        warn!(
            "No symbols configured; edit {} to start tracking tickers",
            config_path.display()
        );
    }

    let client = AlphaVantageClient::new(store.subscribe(), FetchConfig::from_settings(&current))?;
    let publisher = WallpaperPublisher::new(
        settings::default_wallpaper_path(),
        Box::new(SystemDesktop),
    )?;
    let ctx = CycleContext {
        source: Arc::new(client),
        cache: Arc::new(QuoteCache::new()),
        renderer: Arc::new(ChartRenderer::new()),
        publisher: Arc::new(publisher),
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Once => {
            let report = run_once(ctx, store.current()).await;
            match report.outcome {
                CycleOutcome::Success => info!("Wallpaper refreshed"),
                CycleOutcome::Partial { missing } => {
                    warn!("Wallpaper refreshed without data for {}", missing.join(", "))
                }
                CycleOutcome::Failed | CycleOutcome::Cancelled => {
                    error!("Refresh failed; previous wallpaper left in place")
                }
            }
        }
        Commands::Run => {
            store.start_watching()?;

            let (scheduler, handle) =
                RefreshScheduler::new(ctx, store.subscribe(), ActiveHours::default());
            let scheduler_task = tokio::spawn(scheduler.run());

            // Forward on-disk settings edits to the scheduler as change
            // signals; the scheduler reads snapshots from the same channel.
            let change_handle = handle.clone();
            let mut change_rx = store.subscribe();
            tokio::spawn(async move {
                while change_rx.changed().await.is_ok() {
                    change_handle.settings_changed().await;
                }
            });

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            handle.shutdown().await;
            let _ = scheduler_task.await;
        }
    }

    Ok(())
}
