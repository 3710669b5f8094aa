//! daybreak: personalized wake-up alarm daemon.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use daybreak::api::{start_api, ApiState};
use daybreak::app::Daybreak;
use daybreak::config::Config;
use daybreak::history::HistoryLog;

#[derive(Parser, Debug)]
#[command(name = "daybreak", about = "Alarm daemon with generated wake-up speech")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the Markdown report for a day (YYYY-MM-DD or "today") and exit
    #[arg(long, value_name = "DATE")]
    report: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Suppress noisy HTTP internals
    let filter = if args.verbose {
        EnvFilter::new("debug,reqwest=info,hyper=info")
    } else {
        EnvFilter::new("info,reqwest=warn,hyper=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args.config.as_deref());

    if let Some(date) = args.report {
        println!("{}", HistoryLog::new(config.history_dir()).report(&date));
        return Ok(());
    }

    info!("daybreak starting");
    info!("Data directory: {}", config.data_dir().display());

    let app = Daybreak::build(config).await?;
    let tasks = app.start().await;

    if app.config.api.enabled {
        start_api(ApiState::from_app(&app), &app.config.api.bind, app.config.api.port).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for ringing in app.coordinator.ringing() {
        warn!("Alarm {} still ringing at shutdown", ringing.alarm_id);
    }
    for task in tasks {
        task.abort();
    }
    Ok(())
}
