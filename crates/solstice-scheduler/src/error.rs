//! Error types for the scheduler.

use thiserror::Error;

use crate::cron::CronError;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron expression failed to parse.
    #[error(transparent)]
    Cron(#[from] CronError),

    /// Task already exists.
    #[error("task already exists: {0}")]
    TaskExists(String),

    /// Task not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Task already has an execution in flight.
    #[error("task already running: {0}")]
    AlreadyRunning(String),

    /// Attempted to attach a work function to a process-backed task.
    #[error("task work is not a callable: {0}")]
    NotCallable(String),

    /// Execution record not found.
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Registry or record file could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Registry or record file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
