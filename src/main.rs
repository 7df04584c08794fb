//! Application entry point.
//!
//! # Startup sequence
//!
//! 1. Parse the command line and initialise logging.
//! 2. Load [`AppConfig`] (defaults when the file does not exist).
//! 3. Build the [`DeviceContext`].  This creates blocking HTTP clients, so it
//!    happens before the tokio runtime exists.
//! 4. Create the tokio runtime and start the stdin listener thread.
//! 5. Run the [`Dispatcher`] until `/quit`, end of input or Ctrl-C.
//! 6. Reset to idle and put every feedback device at rest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::mpsc;

use rover_pipeline::{
    config::{AppConfig, AppPaths},
    context::DeviceContext,
    feedback::Cue,
    input::{Dispatcher, InputListener},
};

#[derive(Debug, Parser)]
#[command(name = "rover-pipeline", version, about = "Voice assistant pipeline controller")]
struct Cli {
    /// Settings file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use simulated feedback hardware regardless of the configured backend
    #[arg(long)]
    simulate: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Write the default settings to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let paths = match &cli.config {
        Some(path) => AppPaths::with_settings(path),
        None => AppPaths::new(),
    };
    let config_path = paths.settings_file.clone();

    if cli.write_default_config {
        AppConfig::default()
            .save_to(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    let mut config = match AppConfig::load_from(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("Failed to load config ({e}); using defaults");
            AppConfig::default()
        }
    };
    config
        .audio
        .temp_dir
        .get_or_insert_with(|| paths.scratch_dir.clone());
    log::info!("rover-pipeline starting up ({})", config_path.display());

    let ctx = Arc::new(DeviceContext::build(&config, cli.simulate)?);
    ctx.orchestrator.play_system_sound(Cue::Startup);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    let result = rt.block_on(serve(Arc::clone(&ctx)));
    // Cycles still blocked in a stage are abandoned with the runtime.
    rt.shutdown_timeout(std::time::Duration::from_secs(2));

    ctx.shutdown();
    log::info!("rover-pipeline stopped");
    result
}

async fn serve(ctx: Arc<DeviceContext>) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(16);
    let _listener = InputListener::stdin(tx).context("starting input listener")?;
    println!("Enter = record, text = ask, /stop /status /reset /quit");

    let dispatcher = Dispatcher::new(Arc::clone(&ctx.driver));
    tokio::select! {
        _ = dispatcher.run(rx) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            log::info!("interrupted; resetting to idle");
            ctx.orchestrator.force_reset_to_idle();
        }
    }
    Ok(())
}
