//! Solstice: file-backed task scheduler daemon.
//!
//! The daemon owns the scheduling loop only. Task management (adding,
//! listing, toggling) happens through the `solstice-scheduler` library API;
//! the daemon picks registered tasks up from the shared data directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;

#[derive(Parser)]
#[command(name = "solstice")]
#[command(about = "File-backed cron task scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Daemon {
        /// Data directory holding tasks.json, executions/, and logs/
        #[arg(long, env = "SOLSTICE_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// Poll tick in seconds
        #[arg(long, env = "SOLSTICE_TICK_SECS", default_value = "60")]
        tick_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "solstice=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            data_dir,
            tick_secs,
        } => {
            daemon::run(daemon::DaemonConfig {
                data_dir,
                tick_secs,
            })
            .await
        }
    }
}
