//! Task execution with timeouts and bounded retries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::types::{ExecutionRecord, Task, TaskWork};

/// Supervises a single task run: invokes the work with a hard timeout,
/// retries failures per the task's policy, and produces a completed
/// [`ExecutionRecord`] plus a per-execution log file.
///
/// The executor owns no persistent state beyond the log directory.
#[derive(Debug, Clone)]
pub struct Executor {
    log_dir: PathBuf,
}

impl Executor {
    /// Create an executor writing logs under `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    /// Run `task` to a terminal record.
    ///
    /// Infallible by design: every failure mode (nonzero exit, raised error,
    /// timeout, unbound callable) ends as a `failed` record, not an `Err`.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, name = %task.name))]
    pub async fn execute(&self, task: &Task) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(task);
        record.start();

        let log_path = self.log_dir.join(format!("{}.log", record.id));
        let mut log = ExecutionLog::create(&log_path).await;
        record.log_path = Some(log_path);

        log.write(&format!(
            "task: {} ({})\ninvocation: {}\n",
            task.name,
            task.id,
            describe_invocation(&task.work)
        ))
        .await;

        let attempt_timeout = Duration::from_secs(task.timeout_secs);
        let retry_interval = Duration::from_secs(task.retry_interval_secs);
        let total_attempts = task.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            info!(attempt = attempt + 1, total_attempts, "running attempt");
            log.write(&format!("--- attempt {}/{} ---\n", attempt + 1, total_attempts))
                .await;

            match self.run_attempt(task, attempt_timeout, &mut log).await {
                Ok(result) => {
                    record.retry_count = attempt;
                    record.complete(result);
                    break;
                }
                Err(cause) if attempt < task.max_retries => {
                    debug!(%cause, retry_in_secs = task.retry_interval_secs, "attempt failed, retrying");
                    log.write(&format!(
                        "attempt failed: {cause}\nretrying in {}s\n",
                        task.retry_interval_secs
                    ))
                    .await;
                    sleep(retry_interval).await;
                    attempt += 1;
                }
                Err(cause) => {
                    warn!(%cause, attempts = total_attempts, "task failed, retries exhausted");
                    log.write(&format!("attempt failed: {cause}\n")).await;
                    record.retry_count = attempt;
                    record.fail(cause);
                    break;
                }
            }
        }

        log.write(&format!("=== {} ===\n", record.status)).await;
        record
    }

    /// One invocation of the task's work, bounded by `attempt_timeout`.
    async fn run_attempt(
        &self,
        task: &Task,
        attempt_timeout: Duration,
        log: &mut ExecutionLog,
    ) -> Result<Value, String> {
        match &task.work {
            TaskWork::Process {
                program,
                script,
                params,
            } => {
                self.run_process(program, script, params, attempt_timeout, log)
                    .await
            }
            TaskWork::Callable { args, kwargs, func } => {
                let Some(func) = func else {
                    let cause = "callable is not bound; re-attach it after loading".to_string();
                    log.write(&format!("ERROR: {cause}\n")).await;
                    return Err(cause);
                };

                match timeout(attempt_timeout, func(args.clone(), kwargs.clone())).await {
                    Ok(Ok(value)) => {
                        log.write(&format!("result: {value}\n")).await;
                        Ok(value)
                    }
                    Ok(Err(cause)) => {
                        log.write(&format!("error: {cause}\n")).await;
                        Err(cause)
                    }
                    Err(_) => {
                        let cause =
                            format!("timed out after {}s", attempt_timeout.as_secs());
                        log.write(&format!("ERROR: {cause}\n")).await;
                        Err(cause)
                    }
                }
            }
        }
    }

    /// Spawn `<program> <script> [--key=value ...]` and capture its output.
    async fn run_process(
        &self,
        program: &str,
        script: &Path,
        params: &[(String, String)],
        attempt_timeout: Duration,
        log: &mut ExecutionLog,
    ) -> Result<Value, String> {
        let mut cmd = Command::new(program);
        cmd.arg(script);
        for (key, value) in params {
            cmd.arg(format!("--{key}={value}"));
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the wait future on timeout must take the child with it.
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;

        let output = match timeout(attempt_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let cause = format!("failed to wait on {program}: {e}");
                log.write(&format!("ERROR: {cause}\n")).await;
                return Err(cause);
            }
            Err(_) => {
                let cause = format!("timed out after {}s", attempt_timeout.as_secs());
                log.write(&format!("ERROR: {cause}\n")).await;
                return Err(cause);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        log.write(&format!(
            "STDOUT:\n{stdout}\nSTDERR:\n{stderr}\nexit status: {}\n",
            output.status
        ))
        .await;

        if output.status.success() {
            Ok(Value::String(stdout.trim_end().to_string()))
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"));
            Err(format!("{code}: {}", stderr.trim_end()))
        }
    }
}

/// Render the invocation for the log header.
fn describe_invocation(work: &TaskWork) -> String {
    match work {
        TaskWork::Process {
            program,
            script,
            params,
        } => {
            let mut parts = vec![program.clone(), script.display().to_string()];
            parts.extend(params.iter().map(|(k, v)| format!("--{k}={v}")));
            parts.join(" ")
        }
        TaskWork::Callable { args, kwargs, func } => format!(
            "callable{} args={} kwargs={}",
            if func.is_some() { "" } else { " (unbound)" },
            Value::from(args.clone()),
            serde_json::to_string(kwargs).unwrap_or_default(),
        ),
    }
}

/// Per-execution log sink. Write failures degrade to warnings; they never
/// change the outcome of the execution itself.
struct ExecutionLog {
    path: PathBuf,
    file: Option<fs::File>,
}

impl ExecutionLog {
    async fn create(path: &Path) -> Self {
        let file = match fs::File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to create execution log");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    async fn write(&mut self, text: &str) {
        if let Some(file) = &mut self.file {
            if let Err(e) = file.write_all(text.as_bytes()).await {
                warn!(path = %self.path.display(), error = %e, "failed to write execution log");
            } else if let Err(e) = file.flush().await {
                warn!(path = %self.path.display(), error = %e, "failed to flush execution log");
            }
        }
    }
}
