//! File-backed cron task scheduler for Solstice.
//!
//! This crate provides a single-process scheduler that:
//! - Registers tasks backed by external processes or in-process callables
//! - Evaluates 5-field cron expressions for recurring dispatch
//! - Supervises each run with timeouts and bounded retries
//! - Records every run's outcome in a per-execution file store

mod cron;
mod error;
mod executor;
mod history;
mod scheduler;
mod types;

pub use cron::{CronError, CronExpression};
pub use error::SchedulerError;
pub use executor::Executor;
pub use history::{History, HistoryFilter};
pub use scheduler::{DEFAULT_TICK, Scheduler, TaskPatch};
pub use types::{ExecutionRecord, ExecutionStatus, Task, TaskWork, WorkFn};
