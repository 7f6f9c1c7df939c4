use anyhow::{Context, Result};
use breakcast::api;
use breakcast::app::App;
use breakcast::audio_runtime::RodioPlayer;
use breakcast::blocks::{Block, BlockStore};
use breakcast::clock::SystemClock;
use breakcast::config::Config;
use breakcast::console::Console;
use breakcast::logging;
use breakcast::now_playing::NowPlayingReporter;
use breakcast::player::{MemoryPlayer, PlaybackControl};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "breakcast", version, about = "School radio break automation")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "BREAKCAST_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, control server and console
    Serve {
        /// Drive an in-memory player instead of the audio device
        #[arg(long)]
        headless: bool,
        /// Do not read operator keys from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// Edit the block file
    Blocks {
        #[command(subcommand)]
        action: BlocksCmd,
    },
    /// Run one playlist refresh and exit
    Refresh {
        /// Use only songs from the local library
        #[arg(long)]
        local: bool,
        #[arg(long)]
        headless: bool,
    },
}

#[derive(Subcommand)]
enum BlocksCmd {
    /// Show stored blocks
    List,
    /// Add a block: DATE (YYYY-MM-DD) START END (HH:MM)
    Add { date: String, start: String, end: String },
    /// Remove a block
    Remove { date: String, start: String, end: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Blocks { action } => run_blocks(&config, action),
        Commands::Refresh { local, headless } => {
            let _log = logging::init(&config.log).context("Failed to initialise logging")?;
            let app = build_app(config, headless)?;
            let report = if local {
                app.refresher.refresh_local()
            } else {
                app.refresher.run_refresh()
            };
            match report {
                Some(r) => println!(
                    "Queued {} songs, {}",
                    r.added,
                    breakcast::track::format_hms(r.total_duration)
                ),
                None => println!("Refresh skipped: one is already running or a priority playlist is playing"),
            }
            Ok(())
        }
        Commands::Serve { headless, no_console } => {
            let _log = logging::init(&config.log).context("Failed to initialise logging")?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(serve(config, headless, no_console))
        }
    }
}

fn build_app(config: Config, headless: bool) -> Result<App> {
    let player: Arc<dyn PlaybackControl> = if headless {
        info!("Running headless");
        Arc::new(MemoryPlayer::new())
    } else {
        Arc::new(RodioPlayer::spawn(config.playback.ramp()).context("Failed to start audio output")?)
    };
    App::build(config, player, Arc::new(SystemClock)).context("Failed to initialise components")
}

async fn serve(config: Config, headless: bool, no_console: bool) -> Result<()> {
    let addr = config.server.bind_addr();
    let poll = config.schedule.now_playing_poll();
    let app = build_app(config, headless)?;

    app.setup_schedules();
    let driver = app.scheduler.spawn().context("Failed to start scheduler")?;
    let reporter = NowPlayingReporter::new(app.player.clone(), app.backend.clone())
        .spawn(poll)
        .context("Failed to start now-playing reporter")?;
    if !no_console {
        Console::new(app.player.clone(), app.refresher.clone())
            .spawn()
            .context("Failed to start console")?;
    }

    let router = api::build_router(app.api_state());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Control server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    drop(reporter);
    driver.shutdown();
    info!("Shutdown complete");
    Ok(())
}

fn run_blocks(config: &Config, action: BlocksCmd) -> Result<()> {
    let store = BlockStore::new(config.paths.blocks_file());
    match action {
        BlocksCmd::List => {
            let blocks = store.list();
            if blocks.is_empty() {
                println!("No blocks.");
            }
            for block in blocks {
                println!("{}", block);
            }
        }
        BlocksCmd::Add { date, start, end } => {
            let block = Block::parse(&date, &start, &end)?;
            if store.add(&block)? {
                println!("Added block {}", block);
            } else {
                println!("Block {} already exists", block);
            }
        }
        BlocksCmd::Remove { date, start, end } => {
            let block = Block::parse(&date, &start, &end)?;
            if store.remove(&block)? {
                println!("Removed block {}", block);
            } else {
                println!("Block {} not found", block);
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
