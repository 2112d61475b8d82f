//! Task registry and poll loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cron::CronExpression;
use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::history::History;
use crate::types::{ExecutionRecord, Task, TaskWork, WorkFn};

/// Default poll tick: re-evaluate cron tasks once a minute.
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// On-disk shape of the task registry file.
#[derive(Debug, Serialize)]
struct TaskFile<'a> {
    tasks: Vec<&'a Task>,
}

/// Lenient counterpart for loading: entries are parsed one at a time so a
/// single malformed task does not abort startup.
#[derive(Debug, Deserialize)]
struct TaskFileRaw {
    #[serde(default)]
    tasks: Vec<serde_json::Value>,
}

/// Partial update for [`Scheduler::update_task`]. Unset fields are left
/// unchanged; `schedule` is doubly optional so "clear the schedule" is
/// expressible as `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub work: Option<TaskWork>,
    pub schedule: Option<Option<CronExpression>>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

/// The task scheduler.
///
/// Owns the task registry (mirrored to a persisted file, write-through) and
/// the poll loop that dispatches due cron tasks through the executor. All
/// registry access is serialized behind the internal locks; callers may
/// share the scheduler freely via `Arc`.
pub struct Scheduler {
    tasks_path: PathBuf,
    tick: Duration,
    tasks: Arc<RwLock<BTreeMap<String, Task>>>,
    /// Task ids with an execution currently in flight. Checked before every
    /// dispatch so one slow run can never overlap with the next.
    in_flight: Arc<Mutex<HashSet<String>>>,
    executor: Arc<Executor>,
    history: Arc<History>,
    poll_loop: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Create a scheduler persisting its registry at `tasks_path`.
    pub fn new(tasks_path: impl Into<PathBuf>, executor: Executor, history: History) -> Self {
        Self {
            tasks_path: tasks_path.into(),
            tick: DEFAULT_TICK,
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            executor: Arc::new(executor),
            history: Arc::new(history),
            poll_loop: Mutex::new(None),
        }
    }

    /// Override the poll tick (mainly for tests).
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// The history store this scheduler records into.
    pub fn history(&self) -> &History {
        &self.history
    }

    // === Registry ===

    /// Load the persisted registry. Malformed entries are skipped with a
    /// warning; a missing file is an empty registry. Returns the number of
    /// tasks loaded.
    pub async fn load_tasks(&self) -> Result<usize, SchedulerError> {
        let content = match tokio::fs::read_to_string(&self.tasks_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.tasks_path.display(), "no task registry file yet");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let raw: TaskFileRaw = serde_json::from_str(&content)?;
        let mut tasks = BTreeMap::new();
        for entry in raw.tasks {
            match serde_json::from_value::<Task>(entry) {
                Ok(task) => {
                    if tasks.insert(task.id.clone(), task).is_some() {
                        warn!("duplicate task id in registry file, keeping the later entry");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed task in registry file");
                }
            }
        }

        let count = tasks.len();
        info!(count, path = %self.tasks_path.display(), "loaded task registry");
        *self.tasks.write().await = tasks;
        Ok(count)
    }

    /// Register a new task. The registry file is rewritten before the call
    /// returns; on a persist failure the in-memory state is rolled back.
    #[tracing::instrument(skip(self, task), fields(id = %task.id, name = %task.name))]
    pub async fn add_task(&self, task: Task) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskExists(task.id));
        }

        let id = task.id.clone();
        tasks.insert(id.clone(), task);
        if let Err(e) = self.save_tasks(&tasks).await {
            tasks.remove(&id);
            return Err(e);
        }

        info!("task added");
        Ok(())
    }

    /// Remove a task. Existing execution records are retained.
    pub async fn remove_task(&self, id: &str) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if let Err(e) = self.save_tasks(&tasks).await {
            tasks.insert(removed.id.clone(), removed);
            return Err(e);
        }

        info!(id, "task removed");
        Ok(())
    }

    /// Apply a partial update to a task and bump its `updated_at`.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        let previous = task.clone();
        if let Some(name) = patch.name {
            task.name = name;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(work) = patch.work {
            task.work = work;
        }
        if let Some(schedule) = patch.schedule {
            task.schedule = schedule;
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(retry_interval_secs) = patch.retry_interval_secs {
            task.retry_interval_secs = retry_interval_secs;
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            task.timeout_secs = timeout_secs;
        }
        task.updated_at = Utc::now();

        if let Err(e) = self.save_tasks(&tasks).await {
            tasks.insert(id.to_string(), previous);
            return Err(e);
        }

        info!(id, "task updated");
        Ok(())
    }

    /// Enable or disable a task.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), SchedulerError> {
        self.update_task(
            id,
            TaskPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Re-bind the work function of a callable task, e.g. after the
    /// registry was loaded from disk. Nothing is persisted: the function
    /// only ever lives in memory.
    pub async fn attach_callable(&self, id: &str, func: WorkFn) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        match &mut task.work {
            TaskWork::Callable { func: slot, .. } => {
                *slot = Some(func);
                Ok(())
            }
            TaskWork::Process { .. } => Err(SchedulerError::NotCallable(id.to_string())),
        }
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// All registered tasks, ordered by id.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Rewrite the registry file in full, atomically. Called with the write
    /// lock held so concurrent mutations cannot interleave their writes.
    async fn save_tasks(&self, tasks: &BTreeMap<String, Task>) -> Result<(), SchedulerError> {
        if let Some(parent) = self.tasks_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = TaskFile {
            tasks: tasks.values().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let temp_path = self.tasks_path.with_extension("tmp");
        let mut out = tokio::fs::File::create(&temp_path).await?;
        out.write_all(content.as_bytes()).await?;
        out.sync_all().await?;
        tokio::fs::rename(&temp_path, &self.tasks_path).await?;
        Ok(())
    }

    // === Execution ===

    /// Run a task immediately, bypassing the poll loop but going through
    /// the same executor → history path. Returns the completed record.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] if the task has an
    /// execution in flight.
    pub async fn run_now(&self, id: &str) -> Result<ExecutionRecord, SchedulerError> {
        let task = self
            .get_task(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(task.id.clone()) {
                return Err(SchedulerError::AlreadyRunning(task.id));
            }
        }

        let record = self.executor.execute(&task).await;
        let persisted = self.history.record(&record).await;
        self.in_flight.lock().await.remove(&task.id);

        persisted?;
        Ok(record)
    }

    // === Lifecycle ===

    /// Start the poll loop. A no-op if the scheduler is already running.
    pub async fn start(&self) {
        let mut guard = self.poll_loop.lock().await;
        if let Some((_, handle)) = guard.as_ref() {
            if !handle.is_finished() {
                info!("scheduler already running");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = PollLoop {
            tick: self.tick,
            tasks: Arc::clone(&self.tasks),
            in_flight: Arc::clone(&self.in_flight),
            executor: Arc::clone(&self.executor),
            history: Arc::clone(&self.history),
        };
        let handle = tokio::spawn(poll.run(shutdown_rx));
        *guard = Some((shutdown_tx, handle));
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
    }

    /// Stop the poll loop, waiting for it to exit its current tick.
    /// Already-dispatched executions run to completion.
    pub async fn stop(&self) {
        let Some((shutdown_tx, handle)) = self.poll_loop.lock().await.take() else {
            info!("scheduler not running");
            return;
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "poll loop task failed");
        }
        info!("scheduler stopped");
    }
}

/// The background poll loop. Holds clones of the scheduler's shared state
/// so it can outlive the `start` call on its own spawned task.
struct PollLoop {
    tick: Duration,
    tasks: Arc<RwLock<BTreeMap<String, Task>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    executor: Arc<Executor>,
    history: Arc<History>,
}

impl PollLoop {
    /// Every tick, dispatch due cron tasks, until the shutdown channel flips.
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("poll loop starting");
        // Minute each task was last dispatched for, so a tick shorter than
        // a minute (or tick jitter) cannot fire the same due window twice.
        let mut last_dispatched: HashMap<String, DateTime<Utc>> = HashMap::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.dispatch_due(&mut last_dispatched).await;

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(self.tick) => {}
            }
        }

        info!("poll loop exited");
    }

    /// Dispatch every enabled cron task that is due this minute and not
    /// already in flight. Each dispatch runs on its own spawned task, so a
    /// slow execution never delays the next tick or other tasks.
    async fn dispatch_due(&self, last_dispatched: &mut HashMap<String, DateTime<Utc>>) {
        let now = Utc::now();
        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        let candidates: Vec<Task> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.enabled && t.schedule.is_some())
                .cloned()
                .collect()
        };

        for task in candidates {
            let due = task
                .schedule
                .as_ref()
                .is_some_and(|expr| expr.matches(&minute));
            if !due {
                continue;
            }

            if last_dispatched.get(&task.id) == Some(&minute) {
                continue;
            }

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(task.id.clone()) {
                    debug!(id = %task.id, "previous execution still running, skipping dispatch");
                    continue;
                }
            }
            last_dispatched.insert(task.id.clone(), minute);

            info!(id = %task.id, name = %task.name, "dispatching due task");
            let executor = Arc::clone(&self.executor);
            let history = Arc::clone(&self.history);
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let record = executor.execute(&task).await;
                if let Err(e) = history.record(&record).await {
                    error!(id = %task.id, error = %e, "failed to persist execution record");
                }
                in_flight.lock().await.remove(&task.id);
            });
        }

        // Entries for past minutes are no longer needed.
        last_dispatched.retain(|_, m| *m == minute);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;
    use serde_json::Value;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn scheduler_in(dir: &std::path::Path) -> Scheduler {
        let executor = Executor::new(dir.join("logs")).unwrap();
        let history = History::new(dir.join("executions"), dir.join("logs")).unwrap();
        Scheduler::new(dir.join("tasks.json"), executor, history)
    }

    fn process_task(id: &str) -> Task {
        Task::new(id, id, TaskWork::process("sh", "noop.sh", vec![]))
    }

    fn counting_callable(calls: Arc<AtomicU32>) -> WorkFn {
        Arc::new(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Value::Null) })
        })
    }

    #[tokio::test]
    async fn add_get_list_remove_round_trip() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());

        scheduler.add_task(process_task("b")).await.unwrap();
        scheduler.add_task(process_task("a")).await.unwrap();

        assert!(scheduler.get_task("a").await.is_some());
        let ids: Vec<_> = scheduler
            .list_tasks()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, ["a", "b"]);

        scheduler.remove_task("a").await.unwrap();
        assert!(scheduler.get_task("a").await.is_none());
        assert!(matches!(
            scheduler.remove_task("a").await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());

        scheduler.add_task(process_task("dup")).await.unwrap();
        assert!(matches!(
            scheduler.add_task(process_task("dup")).await,
            Err(SchedulerError::TaskExists(_))
        ));
    }

    #[tokio::test]
    async fn registry_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let scheduler = scheduler_in(dir.path());
            scheduler
                .add_task(
                    process_task("daily").with_schedule("0 9 * * *".parse().unwrap()),
                )
                .await
                .unwrap();
            scheduler.add_task(process_task("manual")).await.unwrap();
        }

        let scheduler = scheduler_in(dir.path());
        assert_eq!(scheduler.load_tasks().await.unwrap(), 2);

        let daily = scheduler.get_task("daily").await.unwrap();
        assert_eq!(daily.schedule.as_ref().unwrap().source(), "0 9 * * *");
        assert!(scheduler.get_task("manual").await.unwrap().schedule.is_none());
    }

    #[tokio::test]
    async fn load_then_save_is_idempotent() {
        let dir = tempdir().unwrap();

        {
            let scheduler = scheduler_in(dir.path());
            scheduler
                .add_task(process_task("one").with_retry_policy(5, 10))
                .await
                .unwrap();
            scheduler.add_task(process_task("two")).await.unwrap();
        }

        let before: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("tasks.json")).unwrap())
                .unwrap();

        let scheduler = scheduler_in(dir.path());
        scheduler.load_tasks().await.unwrap();
        // Re-save the loaded registry with no mutation in between.
        let tasks = scheduler.tasks.read().await;
        scheduler.save_tasks(&tasks).await.unwrap();
        drop(tasks);

        let after: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("tasks.json")).unwrap())
                .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn malformed_registry_entry_is_skipped() {
        let dir = tempdir().unwrap();
        let good = serde_json::to_value(process_task("good")).unwrap();
        let file = serde_json::json!({ "tasks": [good, { "id": "broken" }] });
        std::fs::write(
            dir.path().join("tasks.json"),
            serde_json::to_string(&file).unwrap(),
        )
        .unwrap();

        let scheduler = scheduler_in(dir.path());
        assert_eq!(scheduler.load_tasks().await.unwrap(), 1);
        assert!(scheduler.get_task("good").await.is_some());
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_the_mutation() {
        let dir = tempdir().unwrap();
        // A directory at the registry path makes every save fail.
        std::fs::create_dir(dir.path().join("tasks.json")).unwrap();

        let scheduler = scheduler_in(dir.path());
        assert!(scheduler.add_task(process_task("doomed")).await.is_err());
        assert!(scheduler.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn update_task_applies_patch_and_bumps_updated_at() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());

        let task = process_task("job").with_schedule("*/5 * * * *".parse().unwrap());
        let created_updated_at = task.updated_at;
        scheduler.add_task(task).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler
            .update_task(
                "job",
                TaskPatch {
                    name: Some("renamed".into()),
                    schedule: Some(None),
                    max_retries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let task = scheduler.get_task("job").await.unwrap();
        assert_eq!(task.name, "renamed");
        assert!(task.schedule.is_none());
        assert_eq!(task.max_retries, 0);
        assert!(task.updated_at > created_updated_at);

        assert!(matches!(
            scheduler.update_task("missing", TaskPatch::default()).await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_enabled_toggles_and_persists() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());

        scheduler.add_task(process_task("toggle")).await.unwrap();
        scheduler.set_enabled("toggle", false).await.unwrap();
        assert!(!scheduler.get_task("toggle").await.unwrap().enabled);

        let content = std::fs::read_to_string(dir.path().join("tasks.json")).unwrap();
        assert!(content.contains("\"enabled\": false"));
    }

    #[tokio::test]
    async fn run_now_unknown_task_is_not_found() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());
        assert!(matches!(
            scheduler.run_now("ghost").await,
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_now_executes_and_records_history() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());

        let calls = Arc::new(AtomicU32::new(0));
        let task = Task::new(
            "quick",
            "quick",
            TaskWork::callable(counting_callable(calls.clone()), vec![], Map::new()),
        );
        scheduler.add_task(task).await.unwrap();

        let record = scheduler.run_now("quick").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = scheduler.history().get(&record.id).await.unwrap();
        assert_eq!(stored.task_name, "quick");
    }

    #[tokio::test]
    async fn run_now_rejects_overlapping_execution() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler_in(dir.path()));

        let slow: WorkFn = Arc::new(|_, _| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Value::Null)
            })
        });
        scheduler
            .add_task(Task::new(
                "slow",
                "slow",
                TaskWork::callable(slow, vec![], Map::new()),
            ))
            .await
            .unwrap();

        let background = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_now("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            scheduler.run_now("slow").await,
            Err(SchedulerError::AlreadyRunning(_))
        ));

        let record = background.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);

        // Guard is released after the first run finishes.
        let record = scheduler.run_now("slow").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn attach_callable_rebinds_after_reload() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        {
            let scheduler = scheduler_in(dir.path());
            let task = Task::new(
                "bound",
                "bound",
                TaskWork::callable(counting_callable(calls.clone()), vec![], Map::new()),
            )
            .with_retry_policy(0, 0);
            scheduler.add_task(task).await.unwrap();
        }

        let scheduler = scheduler_in(dir.path());
        scheduler.load_tasks().await.unwrap();

        // Detached after reload: the run fails through the normal path.
        let record = scheduler.run_now("bound").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);

        scheduler
            .attach_callable("bound", counting_callable(calls.clone()))
            .await
            .unwrap();
        let record = scheduler.run_now("bound").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attach_callable_rejects_process_tasks() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_in(dir.path());
        scheduler.add_task(process_task("proc")).await.unwrap();

        let func: WorkFn = Arc::new(|_, _| Box::pin(async { Ok(Value::Null) }));
        assert!(matches!(
            scheduler.attach_callable("proc", func).await,
            Err(SchedulerError::NotCallable(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op_and_stop_joins() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler_in(dir.path()).with_tick(Duration::from_millis(20)));

        scheduler.start().await;
        scheduler.start().await;
        scheduler.stop().await;
        // Stopping an idle scheduler is harmless too.
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn poll_loop_dispatches_due_task_once_per_minute() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler_in(dir.path()).with_tick(Duration::from_millis(25)));

        let calls = Arc::new(AtomicU32::new(0));
        let task = Task::new(
            "everyminute",
            "everyminute",
            TaskWork::callable(counting_callable(calls.clone()), vec![], Map::new()),
        )
        .with_schedule("* * * * *".parse().unwrap());
        scheduler.add_task(task).await.unwrap();

        scheduler.start().await;
        // Several ticks pass within the same wall-clock minute.
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        // The 200 ms window can straddle a minute boundary, which is a
        // second legitimate due window. Never more than one per minute.
        let calls = calls.load(Ordering::SeqCst);
        assert!(
            (1..=2).contains(&calls),
            "expected one dispatch per due minute, got {calls}"
        );
    }

    #[tokio::test]
    async fn poll_loop_skips_dispatch_while_execution_in_flight() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler_in(dir.path()).with_tick(Duration::from_millis(25)));

        let starts = Arc::new(AtomicU32::new(0));
        let func: WorkFn = {
            let starts = starts.clone();
            Arc::new(move |_, _| {
                starts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {
                    // Outlives the whole polling window below.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(Value::Null)
                })
            })
        };
        let task = Task::new(
            "longhaul",
            "longhaul",
            TaskWork::callable(func, vec![], Map::new()),
        )
        .with_schedule("* * * * *".parse().unwrap());
        scheduler.add_task(task).await.unwrap();

        scheduler.start().await;
        // Many ticks pass while the first execution is still running; every
        // later due evaluation must be skipped by the in-flight guard, even
        // if the window crosses into a new minute.
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert_eq!(
            starts.load(Ordering::SeqCst),
            1,
            "in-flight task must not be dispatched concurrently"
        );
    }

    #[tokio::test]
    async fn poll_loop_skips_disabled_tasks() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler_in(dir.path()).with_tick(Duration::from_millis(25)));

        let calls = Arc::new(AtomicU32::new(0));
        let mut task = Task::new(
            "off",
            "off",
            TaskWork::callable(counting_callable(calls.clone()), vec![], Map::new()),
        )
        .with_schedule("* * * * *".parse().unwrap());
        task.enabled = false;
        scheduler.add_task(task).await.unwrap();

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
