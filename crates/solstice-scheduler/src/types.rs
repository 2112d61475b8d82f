//! Task and execution record types.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::cron::CronExpression;

/// In-process work function: positional and keyword arguments in, a result
/// value or an error message out.
pub type WorkFn = Arc<
    dyn Fn(
            Vec<Value>,
            BTreeMap<String, Value>,
        ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// The unit of work a task invokes.
///
/// Both variants expose the same capability to the executor: invoke, within
/// a bounded time, yielding success-with-result or failure-with-cause.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskWork {
    /// An external script run as `<program> <script> [--key=value ...]`,
    /// parameters applied in insertion order.
    Process {
        program: String,
        script: PathBuf,
        #[serde(default)]
        params: Vec<(String, String)>,
    },
    /// An in-process callable. The function itself cannot be persisted:
    /// tasks loaded from disk carry `func: None` until the owner re-binds
    /// one via `Scheduler::attach_callable`.
    Callable {
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: BTreeMap<String, Value>,
        #[serde(skip)]
        func: Option<WorkFn>,
    },
}

impl TaskWork {
    /// Work backed by an external script.
    pub fn process(
        program: impl Into<String>,
        script: impl Into<PathBuf>,
        params: Vec<(String, String)>,
    ) -> Self {
        Self::Process {
            program: program.into(),
            script: script.into(),
            params,
        }
    }

    /// Work backed by an in-process callable.
    pub fn callable(func: WorkFn, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self::Callable {
            args,
            kwargs,
            func: Some(func),
        }
    }
}

impl fmt::Debug for TaskWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process {
                program,
                script,
                params,
            } => f
                .debug_struct("Process")
                .field("program", program)
                .field("script", script)
                .field("params", params)
                .finish(),
            Self::Callable { args, kwargs, func } => f
                .debug_struct("Callable")
                .field("args", args)
                .field("kwargs", kwargs)
                .field("func", &func.as_ref().map(|_| "<fn>"))
                .finish(),
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, stable identifier. Immutable after creation.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// What to invoke.
    pub work: TaskWork,
    /// Recurring schedule. `None` means the task only runs on demand.
    #[serde(default)]
    pub schedule: Option<CronExpression>,
    /// Disabled tasks are never dispatched by the poll loop.
    pub enabled: bool,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Seconds to wait between attempts.
    pub retry_interval_secs: u64,
    /// Hard wall-clock ceiling per attempt, in seconds.
    pub timeout_secs: u64,
    /// When this task was registered.
    pub created_at: DateTime<Utc>,
    /// When this task was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with default policy: 3 retries, 60 s apart, 1 h timeout.
    pub fn new(id: impl Into<String>, name: impl Into<String>, work: TaskWork) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            work,
            schedule: None,
            enabled: true,
            max_retries: 3,
            retry_interval_secs: 60,
            timeout_secs: 3600,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a cron schedule.
    pub fn with_schedule(mut self, schedule: CronExpression) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, max_retries: u32, retry_interval_secs: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_interval_secs = retry_interval_secs;
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet started.
    Waiting,
    /// Attempt loop in progress.
    Running,
    /// Finished successfully.
    Completed,
    /// All attempts exhausted.
    Failed,
    /// Abandoned before completion.
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One run's lifecycle and outcome.
///
/// The record references its task by id only; the task may be deleted or
/// renamed later, so the name at dispatch time is snapshotted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution id.
    pub id: String,
    /// Id of the task that produced this run.
    pub task_id: String,
    /// Task name at dispatch time.
    pub task_name: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Set exactly once, on the waiting → running transition.
    pub start_time: Option<DateTime<Utc>>,
    /// Set exactly once, on the running → terminal transition.
    pub end_time: Option<DateTime<Utc>>,
    /// End minus start, defined once the run has ended.
    pub duration_secs: Option<f64>,
    /// Retries actually consumed (0 = succeeded or gave up on first attempt).
    pub retry_count: u32,
    /// Opaque success payload.
    pub result: Option<Value>,
    /// Terminal error message, for failed runs.
    pub error: Option<String>,
    /// Path of the captured per-execution log.
    pub log_path: Option<PathBuf>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a new record in the waiting state.
    pub fn new(task: &Task) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: ExecutionStatus::Waiting,
            start_time: None,
            end_time: None,
            duration_secs: None,
            retry_count: 0,
            result: None,
            error: None,
            log_path: None,
            created_at: Utc::now(),
        }
    }

    /// Transition waiting → running, stamping the start time.
    pub fn start(&mut self) {
        if self.status != ExecutionStatus::Waiting {
            warn!(id = %self.id, status = %self.status, "ignoring start on non-waiting execution");
            return;
        }
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Transition running → completed with a success payload.
    pub fn complete(&mut self, result: Value) {
        if !self.finish(ExecutionStatus::Completed) {
            return;
        }
        self.result = Some(result);
    }

    /// Transition running → failed with the terminal error.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.finish(ExecutionStatus::Failed) {
            return;
        }
        self.error = Some(error.into());
    }

    /// Transition running → cancelled.
    pub fn cancel(&mut self) {
        self.finish(ExecutionStatus::Cancelled);
    }

    /// Stamp end time and duration on the terminal transition. Terminal
    /// records are final; repeated transitions are ignored.
    fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            warn!(id = %self.id, status = %self.status, "ignoring transition on terminal execution");
            return false;
        }
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_secs = self
            .start_time
            .map(|start| (end - start).num_milliseconds() as f64 / 1000.0);
        true
    }
}
