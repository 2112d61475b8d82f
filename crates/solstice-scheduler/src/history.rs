//! Durable execution history.
//!
//! Each execution record is one self-contained JSON file named by execution
//! id; each captured log is one text file next to it. Queries are full scans
//! over the loaded records, which is fine at this scale.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::SchedulerError;
use crate::types::{ExecutionRecord, ExecutionStatus};

/// Filter for [`History::filter`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Exact task-name match.
    pub task_name: Option<String>,
    /// Status match.
    pub status: Option<ExecutionStatus>,
    /// Only records started at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only records started at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(name) = &self.task_name {
            if record.task_name != *name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(start) = record.start_time else {
                return false;
            };
            if self.since.is_some_and(|since| start < since) {
                return false;
            }
            if self.until.is_some_and(|until| start > until) {
                return false;
            }
        }
        true
    }
}

/// File-backed store of execution records and their logs.
#[derive(Debug, Clone)]
pub struct History {
    records_dir: PathBuf,
    logs_dir: PathBuf,
}

impl History {
    /// Create a history store, creating both directories if needed.
    pub fn new(
        records_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let records_dir = records_dir.into();
        let logs_dir = logs_dir.into();
        std::fs::create_dir_all(&records_dir)?;
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            records_dir,
            logs_dir,
        })
    }

    /// The directory execution logs are written to.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Persist one record as `<execution_id>.json`, atomically.
    pub async fn record(&self, record: &ExecutionRecord) -> Result<(), SchedulerError> {
        let path = self.record_path(&record.id);
        let content = serde_json::to_string_pretty(record)?;

        // Write to temp file first, then rename for atomicity.
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        debug!(id = %record.id, status = %record.status, "recorded execution");
        Ok(())
    }

    /// Fetch one record by execution id.
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord, SchedulerError> {
        let path = self.record_path(execution_id);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SchedulerError::ExecutionNotFound(execution_id.to_string())
            } else {
                SchedulerError::Persistence(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All records, newest start time first. Records that never started
    /// sort last. Malformed files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.records_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable execution record");
                    continue;
                }
            };
            match serde_json::from_str::<ExecutionRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed execution record");
                }
            }
        }

        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }

    /// Records matching `filter`, in the same order as [`History::list`].
    pub async fn filter(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        let mut records = self.list().await?;
        records.retain(|r| filter.matches(r));
        Ok(records)
    }

    /// Raw captured log text for one execution.
    pub async fn log(&self, execution_id: &str) -> Result<String, SchedulerError> {
        let path = self.logs_dir.join(format!("{execution_id}.log"));
        fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SchedulerError::ExecutionNotFound(execution_id.to_string())
            } else {
                SchedulerError::Persistence(e)
            }
        })
    }

    /// Delete one record and its log file, if present.
    pub async fn delete(&self, execution_id: &str) -> Result<(), SchedulerError> {
        let path = self.record_path(execution_id);
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SchedulerError::ExecutionNotFound(execution_id.to_string())
            } else {
                SchedulerError::Persistence(e)
            }
        })?;

        let log_path = self.logs_dir.join(format!("{execution_id}.log"));
        if let Err(e) = fs::remove_file(&log_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %execution_id, error = %e, "failed to remove execution log");
            }
        }
        Ok(())
    }

    /// Remove terminal records whose end time is older than `age`.
    /// Returns how many were removed. In-flight records are never pruned.
    pub async fn prune_older_than(&self, age: Duration) -> Result<usize, SchedulerError> {
        let cutoff = Utc::now() - age;
        let mut removed = 0;

        for record in self.list().await? {
            if !record.status.is_terminal() {
                continue;
            }
            let Some(end) = record.end_time else {
                continue;
            };
            if end < cutoff {
                self.delete(&record.id).await?;
                removed += 1;
            }
        }

        debug!(removed, "pruned execution history");
        Ok(removed)
    }

    fn record_path(&self, execution_id: &str) -> PathBuf {
        self.records_dir.join(format!("{execution_id}.json"))
    }
}
