//! Daemon command: run the scheduler loop until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use tracing::{error, info};

use solstice_scheduler::{Executor, History, Scheduler};

/// Configuration for the daemon.
pub struct DaemonConfig {
    /// Directory holding `tasks.json`, `executions/`, and `logs/`.
    pub data_dir: PathBuf,
    /// Poll tick in seconds.
    pub tick_secs: u64,
}

/// Build the scheduler from the data directory, start the poll loop, and
/// block until ctrl-c. In-flight executions finish before the loop exits;
/// they are not aborted.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(data_dir = %config.data_dir.display(), tick_secs = config.tick_secs, "starting solstice daemon");

    let logs_dir = config.data_dir.join("logs");
    let executor = Executor::new(&logs_dir).into_diagnostic()?;
    let history =
        History::new(config.data_dir.join("executions"), &logs_dir).into_diagnostic()?;

    let scheduler = Arc::new(
        Scheduler::new(config.data_dir.join("tasks.json"), executor, history)
            .with_tick(Duration::from_secs(config.tick_secs)),
    );

    let loaded = scheduler.load_tasks().await.into_diagnostic()?;
    info!(tasks = loaded, "task registry loaded");

    scheduler.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");

    scheduler.stop().await;
    info!("daemon exited");
    Ok(())
}
